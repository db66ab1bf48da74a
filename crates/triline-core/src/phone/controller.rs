//! Call control operations
//!
//! The operations the UI calls, composed from the session store and the
//! line table. Device selection is read from host storage on every dial
//! and answer, so a device change in the settings screen applies to the
//! next call without replumbing anything.

use std::sync::Arc;

use crate::error::{PhoneError, PhoneResult};
use crate::line::LineNumber;
use crate::media::MediaConstraints;
use crate::session::{DtmfTimings, SessionId, TransferMode};
use crate::storage::HostStorageExt;

use super::Phone;

impl Phone {
    fn constraints(&self) -> MediaConstraints {
        let (input, output) = self.storage.selected_devices();
        MediaConstraints::from_config(&self.config, input, output)
    }

    /// Dial a target: normalize to a SIP URI in the configured domain,
    /// allocate a line, start the outgoing session.
    ///
    /// With all three lines occupied this returns `AllLinesBusy` before
    /// any SIP is generated.
    pub async fn dial(self: &Arc<Self>, target: &str) -> PhoneResult<SessionId> {
        if !self.registrar.is_registered() {
            return Err(PhoneError::NotRegistered);
        }
        self.store.create_outgoing(target, self.constraints())
    }

    /// Answer an incoming session with the currently selected devices
    pub async fn answer(self: &Arc<Self>, id: &SessionId) -> PhoneResult<()> {
        self.store.answer(id, self.constraints()).await
    }

    /// Hang up a specific session, or the selected line's session
    pub async fn hang_up(self: &Arc<Self>, id: Option<SessionId>) -> PhoneResult<()> {
        let id = match id {
            Some(id) => id,
            None => self
                .lines
                .selected_line()
                .and_then(|line| self.lines.session_on(line))
                .ok_or_else(|| PhoneError::internal("no session on the selected line"))?,
        };
        self.store.hang_up(&id).await
    }

    /// Select a line key.
    ///
    /// If the previously selected line holds an established, unheld
    /// session it is put on hold first - `sessionHeld` precedes the
    /// `lineChanged` this publishes. Re-selecting the current line is a
    /// no-op.
    pub async fn select_line(self: &Arc<Self>, line: LineNumber) -> PhoneResult<()> {
        let (current, hold_candidate) = self.lines.prepare_select(line)?;
        if current == Some(line) {
            return Ok(());
        }
        if let Some(previous_session) = hold_candidate {
            if let Err(e) = self.store.hold(&previous_session, true).await {
                tracing::warn!(
                    session = %previous_session,
                    error = %e,
                    "auto-hold failed during line switch"
                );
            }
        }
        self.lines.finish_select(line);
        Ok(())
    }

    /// Put a session on hold, or resume it
    pub async fn hold(self: &Arc<Self>, id: &SessionId, on_hold: bool) -> PhoneResult<()> {
        self.store.hold(id, on_hold).await
    }

    /// Mute or unmute local capture
    pub fn mute(&self, id: &SessionId, muted: bool) -> PhoneResult<()> {
        self.store.mute(id, muted)
    }

    /// Transfer a session. Blind transfers resolve through sipfrag
    /// notifications; attended transfers return the consultation
    /// session id.
    pub async fn transfer(
        self: &Arc<Self>,
        id: &SessionId,
        target: &str,
        mode: TransferMode,
    ) -> PhoneResult<Option<SessionId>> {
        match mode {
            TransferMode::Blind => {
                self.store.blind_transfer(id, target).await?;
                Ok(None)
            }
            TransferMode::Attended => {
                let consultation = self
                    .store
                    .attended_transfer(id, target, self.constraints())
                    .await?;
                Ok(Some(consultation))
            }
        }
    }

    /// Abandon a pending attended transfer and resume the original call
    pub async fn cancel_attended_transfer(self: &Arc<Self>, id: &SessionId) -> PhoneResult<()> {
        self.store.cancel_attended(id).await
    }

    /// Send one DTMF tone
    pub async fn send_dtmf(self: &Arc<Self>, id: &SessionId, tone: char) -> PhoneResult<()> {
        self.store.send_dtmf(id, tone).await
    }

    /// Send a DTMF sequence. A session that terminates mid-sequence is
    /// benign - the far end hung up after the code went through - so
    /// `SessionGone` is swallowed here; every other error surfaces.
    pub async fn send_dtmf_sequence(
        self: &Arc<Self>,
        id: &SessionId,
        tones: &str,
        timings: Option<DtmfTimings>,
    ) -> PhoneResult<()> {
        match self.store.send_dtmf_sequence(id, tones, timings).await {
            Ok(_) => Ok(()),
            Err(PhoneError::SessionGone { session_id }) => {
                tracing::debug!(session = %session_id, "session ended mid-sequence");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }
}
