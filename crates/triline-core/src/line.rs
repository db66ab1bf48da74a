//! Line key management
//!
//! Three fixed line slots map the concurrently active sessions to the
//! "Line 1/2/3" keys the user sees. Slots hold only session ids and
//! cached peer labels - sessions themselves stay in the session store -
//! so the session/line/selection graph stays acyclic.
//!
//! The rules enforced here are deliberately narrow:
//!
//! - allocation always takes the lowest-numbered idle slot;
//! - at most one line is selected, and only occupied slots are
//!   selectable;
//! - switching the selection is the *only* trigger for auto-hold, which
//!   the caller performs before committing the switch;
//! - a fresh assignment on Line 1 steals focus only when no other call
//!   exists and the selection sat on line 2 or 3. This mirrors the
//!   shipped behaviour exactly, surprising as the narrowness is.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};
use crate::events::{EventBus, PhoneEvent};
use crate::session::{PeerInfo, SessionId};

/// A line key number, 1..=3
pub type LineNumber = u8;

/// Number of line slots on the phone
pub const LINE_COUNT: u8 = 3;

/// Presentation state of one line slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineState {
    /// No session bound
    Idle,
    /// Incoming session ringing
    Ringing,
    /// Outgoing session being established
    Dialing,
    /// Established session, media flowing
    Active,
    /// Established session on hold
    Hold,
}

/// One line slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSlot {
    /// Line number, 1..=3
    pub number: LineNumber,
    /// Presentation state
    pub state: LineState,
    /// Bound session, `None` iff `state` is `Idle`
    pub session: Option<SessionId>,
    /// Cached peer label for rendering while the session exists
    pub peer: Option<PeerInfo>,
}

impl LineSlot {
    fn idle(number: LineNumber) -> Self {
        LineSlot { number, state: LineState::Idle, session: None, peer: None }
    }
}

/// The fixed three-slot line table plus the optional selected line
pub struct LineKeyManager {
    slots: RwLock<Vec<LineSlot>>,
    selected: RwLock<Option<LineNumber>>,
    bus: Arc<EventBus>,
}

impl LineKeyManager {
    /// A manager with all slots idle and nothing selected
    pub fn new(bus: Arc<EventBus>) -> Self {
        LineKeyManager {
            slots: RwLock::new((1..=LINE_COUNT).map(LineSlot::idle).collect()),
            selected: RwLock::new(None),
            bus,
        }
    }

    fn index(line: LineNumber) -> PhoneResult<usize> {
        if (1..=LINE_COUNT).contains(&line) {
            Ok((line - 1) as usize)
        } else {
            Err(PhoneError::InvalidLine { line })
        }
    }

    /// Lowest-numbered idle line, if any
    pub fn available_line(&self) -> Option<LineNumber> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .find(|slot| slot.state == LineState::Idle)
            .map(|slot| slot.number)
    }

    /// Whether every slot is occupied
    pub fn all_busy(&self) -> bool {
        self.available_line().is_none()
    }

    /// Non-idle line numbers in order
    pub fn active_lines(&self) -> Vec<LineNumber> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|slot| slot.state != LineState::Idle)
            .map(|slot| slot.number)
            .collect()
    }

    /// Number of occupied slots
    pub fn occupied_count(&self) -> usize {
        self.active_lines().len()
    }

    /// Clone of one slot
    pub fn slot(&self, line: LineNumber) -> PhoneResult<LineSlot> {
        let idx = Self::index(line)?;
        Ok(self.slots.read().unwrap()[idx].clone())
    }

    /// Clone of the whole table
    pub fn snapshot(&self) -> Vec<LineSlot> {
        self.slots.read().unwrap().clone()
    }

    /// The session bound to a line, if any
    pub fn session_on(&self, line: LineNumber) -> Option<SessionId> {
        let idx = Self::index(line).ok()?;
        self.slots.read().unwrap()[idx].session
    }

    /// The currently selected line
    pub fn selected_line(&self) -> Option<LineNumber> {
        *self.selected.read().unwrap()
    }

    /// Bind a session to an idle slot.
    ///
    /// Performed before any SIP is sent so a transient setup failure can
    /// never leave a line pointing at a session that was never created.
    pub fn assign(
        &self,
        line: LineNumber,
        session: SessionId,
        peer: PeerInfo,
        state: LineState,
    ) -> PhoneResult<()> {
        let idx = Self::index(line)?;
        let mut slots = self.slots.write().unwrap();
        let slot = &mut slots[idx];
        if slot.state != LineState::Idle {
            return Err(PhoneError::InvalidLine { line });
        }
        slot.state = state;
        slot.session = Some(session);
        slot.peer = Some(peer);
        Ok(())
    }

    /// Apply the Line-1 auto-focus rule after an assignment.
    ///
    /// Focus moves only when the new session landed on line 1, it is the
    /// only non-terminal session, and the selection sat on 2 or 3.
    pub fn apply_auto_focus(&self, assigned_line: LineNumber, other_sessions: usize) {
        if assigned_line != 1 || other_sessions != 0 {
            return;
        }
        if matches!(self.selected_line(), Some(2) | Some(3)) {
            self.finish_select(1);
        }
    }

    /// Update the presentation state of an occupied slot
    pub fn update_state(&self, line: LineNumber, state: LineState) -> PhoneResult<()> {
        let idx = Self::index(line)?;
        let mut slots = self.slots.write().unwrap();
        let slot = &mut slots[idx];
        if slot.session.is_none() {
            return Err(PhoneError::InvalidLine { line });
        }
        slot.state = state;
        Ok(())
    }

    /// Release a slot back to idle.
    ///
    /// Clears the selection (publishing `LineChanged` to none) when the
    /// released line was the selected one.
    pub fn clear(&self, line: LineNumber) -> PhoneResult<()> {
        let idx = Self::index(line)?;
        {
            let mut slots = self.slots.write().unwrap();
            slots[idx] = LineSlot::idle(line);
        }
        let mut selected = self.selected.write().unwrap();
        if *selected == Some(line) {
            *selected = None;
            drop(selected);
            self.bus.publish(PhoneEvent::LineChanged { previous: Some(line), current: None });
        }
        Ok(())
    }

    /// First half of a selection change: validates the target and names
    /// the session the caller must auto-hold before committing.
    ///
    /// Returns `(currently_selected, hold_candidate)`. The candidate is
    /// the previously selected line's session when that slot shows an
    /// established, not-held call.
    pub fn prepare_select(
        &self,
        line: LineNumber,
    ) -> PhoneResult<(Option<LineNumber>, Option<SessionId>)> {
        let idx = Self::index(line)?;
        let slots = self.slots.read().unwrap();
        if slots[idx].session.is_none() {
            return Err(PhoneError::InvalidLine { line });
        }
        let current = self.selected_line();
        let candidate = current
            .filter(|&prev| prev != line)
            .and_then(|prev| Self::index(prev).ok())
            .map(|prev_idx| &slots[prev_idx])
            .filter(|slot| slot.state == LineState::Active)
            .and_then(|slot| slot.session);
        Ok((current, candidate))
    }

    /// Second half of a selection change: commit and publish.
    ///
    /// Idempotent - re-selecting the current line publishes nothing, so
    /// two consecutive `select_line(n)` calls yield exactly one
    /// `LineChanged`.
    pub fn finish_select(&self, line: LineNumber) {
        let previous = {
            let mut selected = self.selected.write().unwrap();
            let previous = *selected;
            if previous == Some(line) {
                return;
            }
            *selected = Some(line);
            previous
        };
        self.bus.publish(PhoneEvent::LineChanged { previous, current: Some(line) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (LineKeyManager, tokio::sync::broadcast::Receiver<PhoneEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        (LineKeyManager::new(bus), rx)
    }

    fn peer() -> PeerInfo {
        PeerInfo::new("2000")
    }

    #[test]
    fn allocation_prefers_lowest_idle() {
        let (lines, _rx) = manager();
        assert_eq!(lines.available_line(), Some(1));
        lines.assign(1, SessionId::new_v4(), peer(), LineState::Dialing).unwrap();
        assert_eq!(lines.available_line(), Some(2));
        lines.assign(2, SessionId::new_v4(), peer(), LineState::Ringing).unwrap();
        lines.assign(3, SessionId::new_v4(), peer(), LineState::Active).unwrap();
        assert!(lines.all_busy());
        assert_eq!(lines.available_line(), None);
    }

    #[test]
    fn clear_restores_idle_and_drops_selection() {
        let (lines, mut rx) = manager();
        let sid = SessionId::new_v4();
        lines.assign(2, sid, peer(), LineState::Active).unwrap();
        lines.finish_select(2);
        assert_eq!(rx.try_recv().unwrap(),
            PhoneEvent::LineChanged { previous: None, current: Some(2) });

        lines.clear(2).unwrap();
        assert_eq!(lines.selected_line(), None);
        assert_eq!(lines.available_line(), Some(1));
        assert_eq!(rx.try_recv().unwrap(),
            PhoneEvent::LineChanged { previous: Some(2), current: None });
    }

    #[test]
    fn double_assignment_is_rejected() {
        let (lines, _rx) = manager();
        lines.assign(1, SessionId::new_v4(), peer(), LineState::Active).unwrap();
        assert!(lines.assign(1, SessionId::new_v4(), peer(), LineState::Active).is_err());
    }

    #[test]
    fn selecting_idle_line_is_rejected() {
        let (lines, _rx) = manager();
        assert!(lines.prepare_select(2).is_err());
        assert!(lines.prepare_select(0).is_err());
        assert!(lines.prepare_select(4).is_err());
    }

    #[test]
    fn select_twice_publishes_once() {
        let (lines, mut rx) = manager();
        lines.assign(1, SessionId::new_v4(), peer(), LineState::Active).unwrap();
        lines.finish_select(1);
        lines.finish_select(1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hold_candidate_only_for_active_previous_line() {
        let (lines, _rx) = manager();
        let held = SessionId::new_v4();
        let active = SessionId::new_v4();
        lines.assign(1, active, peer(), LineState::Active).unwrap();
        lines.assign(2, held, peer(), LineState::Hold).unwrap();

        lines.finish_select(1);
        let (_, candidate) = lines.prepare_select(2).unwrap();
        assert_eq!(candidate, Some(active));

        // from a held line no auto-hold candidate exists
        lines.finish_select(2);
        let (_, candidate) = lines.prepare_select(1).unwrap();
        assert_eq!(candidate, None);
    }

    #[test]
    fn auto_focus_is_narrow() {
        let (lines, _rx) = manager();
        let s2 = SessionId::new_v4();
        lines.assign(2, s2, peer(), LineState::Active).unwrap();
        lines.finish_select(2);
        let s1 = SessionId::new_v4();
        lines.assign(1, s1, peer(), LineState::Ringing).unwrap();

        // another call exists: no steal
        lines.apply_auto_focus(1, 1);
        assert_eq!(lines.selected_line(), Some(2));

        // same table but reported as the only call: focus moves to 1
        lines.apply_auto_focus(1, 0);
        assert_eq!(lines.selected_line(), Some(1));
    }

    #[test]
    fn auto_focus_ignores_other_lines_and_empty_selection() {
        let (lines, _rx) = manager();
        let s2 = SessionId::new_v4();
        lines.assign(2, s2, peer(), LineState::Ringing).unwrap();
        // assignment landed on line 2, never steals
        lines.apply_auto_focus(2, 0);
        assert_eq!(lines.selected_line(), None);

        let s1 = SessionId::new_v4();
        lines.assign(1, s1, peer(), LineState::Ringing).unwrap();
        // nothing selected: rule requires a 2/3 selection to displace
        lines.apply_auto_focus(1, 0);
        assert_eq!(lines.selected_line(), None);
    }
}
