//! Session data model
//!
//! This module provides the call information structures shared across the
//! core: lifecycle states, direction, transfer records, the serializable
//! snapshot carried in events, and the aggregate call statistics.
//!
//! The owning `Session` record itself lives in the store module; only
//! ids and snapshots cross component boundaries, which is what keeps the
//! session/line/selection graph acyclic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::line::LineNumber;

/// Unique identifier for a session
///
/// Assigned at creation and stable for the session's whole lifecycle;
/// every event and every public operation references sessions by this id.
pub type SessionId = Uuid;

/// Current state of a session in its lifecycle
///
/// ```text
/// Initial ──invite/accept──► Establishing ──answered──► Established ──bye──► Terminated
///    │                             │                         │                  ▲
///    └────────────── reject/cancel/fail ────────────────────┴──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created locally, no SIP exchanged yet
    Initial,
    /// INVITE in flight (outgoing) or ringing unanswered (incoming)
    Establishing,
    /// Answered; media can flow
    Established,
    /// Ended normally
    Terminated,
    /// Setup failed (rejected, cancelled, or network error)
    Failed,
}

impl SessionState {
    /// Whether this is a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Failed)
    }

    /// Whether the session still occupies a line slot
    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Initial => write!(f, "Initial"),
            SessionState::Establishing => write!(f, "Establishing"),
            SessionState::Established => write!(f, "Established"),
            SessionState::Terminated => write!(f, "Terminated"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Direction of a session from this phone's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// A remote party called us
    Incoming,
    /// We called a remote party
    Outgoing,
}

/// How a transfer was performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// REFER without consultation
    Blind,
    /// Consultation call first, then REFER with a replacement reference
    Attended,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Blind => write!(f, "blind"),
            TransferMode::Attended => write!(f, "attended"),
        }
    }
}

/// Peer identity as displayed on a line key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Display name from the remote From/To header, if any
    pub display_name: Option<String>,
    /// The dial string or SIP user the session is with
    pub dial_string: String,
}

impl PeerInfo {
    /// Peer info with no display name
    pub fn new(dial_string: impl Into<String>) -> Self {
        PeerInfo { display_name: None, dial_string: dial_string.into() }
    }

    /// What the UI should show: display name when known, dial string otherwise
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.dial_string)
    }
}

/// Final acceptance bookkeeping for a transfer attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCompletion {
    /// Whether the transfer target accepted
    pub success: bool,
    /// The final sipfrag disposition (e.g. "200 OK", "486 Busy Here")
    pub disposition: String,
    /// When the final notification arrived
    pub at: DateTime<Utc>,
}

/// One transfer attempt on a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Blind or attended
    pub mode: TransferMode,
    /// The transfer target as given by the caller
    pub target: String,
    /// When the REFER was issued
    pub initiated_at: DateTime<Utc>,
    /// Most recent sipfrag disposition, including provisionals
    pub last_disposition: Option<String>,
    /// Final acceptance, once known
    pub completion: Option<TransferCompletion>,
}

impl TransferRecord {
    /// A freshly initiated transfer attempt
    pub fn new(mode: TransferMode, target: impl Into<String>) -> Self {
        TransferRecord {
            mode,
            target: target.into(),
            initiated_at: Utc::now(),
            last_disposition: None,
            completion: None,
        }
    }
}

/// Serializable view of a session, carried in events and accessors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Incoming or outgoing
    pub direction: Direction,
    /// The line slot the session occupies
    pub line: LineNumber,
    /// Remote party
    pub peer: PeerInfo,
    /// Lifecycle state
    pub state: SessionState,
    /// Whether the session is on hold
    pub on_hold: bool,
    /// Whether local capture is muted
    pub muted: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Answer time, once established
    pub answered_at: Option<DateTime<Utc>>,
    /// Transfer attempts in order
    pub transfers: Vec<TransferRecord>,
}

impl SessionSnapshot {
    /// Running call duration in seconds (zero before answer)
    pub fn duration_secs(&self) -> i64 {
        self.answered_at
            .map(|t| (Utc::now() - t).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Aggregate call statistics, updated at session bookkeeping points
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    /// Outgoing sessions created
    pub placed: u64,
    /// Incoming sessions created
    pub received: u64,
    /// Sessions that reached Established
    pub answered: u64,
    /// Incoming sessions that ended unanswered
    pub missed: u64,
    /// Sessions that ended in Failed
    pub failed: u64,
    /// Total Established time across ended sessions, seconds
    pub talk_seconds: u64,
}
