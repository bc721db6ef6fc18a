//! State shared by every call mode

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::defect;
use crate::types::CallObjectId;

/// Progression of a call through the OS telephony surface.
///
/// Moves forward only. Skipping forward is tolerated (a call torn down
/// before it was ever reported jumps straight to `Removed`); moving
/// backward is a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SystemReportState {
    NotReported,
    /// Reporting has been requested but not acknowledged
    Pending,
    Reported,
    Removed,
}

/// Mode-independent state carried by every [`crate::call::Call`].
#[derive(Debug)]
pub struct CommonCallState {
    id: CallObjectId,
    created_at: DateTime<Utc>,
    connected_at: Mutex<Option<Instant>>,
    system_state: Mutex<SystemReportState>,
}

impl CommonCallState {
    pub fn new() -> Self {
        Self {
            id: CallObjectId::new(),
            created_at: Utc::now(),
            connected_at: Mutex::new(None),
            system_state: Mutex::new(SystemReportState::NotReported),
        }
    }

    pub fn id(&self) -> CallObjectId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record the connection timestamp if it has not been recorded yet.
    ///
    /// Returns `true` only for the first invocation; reconnects and
    /// duplicate connected events leave the original timestamp in place.
    pub fn set_connected_if_needed(&self) -> bool {
        let Ok(mut connected_at) = self.connected_at.lock() else {
            return false;
        };
        if connected_at.is_some() {
            return false;
        }
        *connected_at = Some(Instant::now());
        true
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at.lock().ok().and_then(|guard| *guard)
    }

    /// Time since the call connected.
    ///
    /// Asking before the call connected is a defect; release builds get
    /// `Duration::ZERO` back.
    pub fn connection_duration(&self) -> Duration {
        match self.connected_at() {
            Some(connected_at) => connected_at.elapsed(),
            None => {
                defect!(call_id = %self.id, "connection duration requested before call connected");
                Duration::ZERO
            }
        }
    }

    pub fn system_report_state(&self) -> SystemReportState {
        self.system_state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(SystemReportState::Removed)
    }

    pub fn mark_pending_report_to_system(&self) {
        self.advance_system_state(SystemReportState::Pending);
    }

    pub fn mark_reported_to_system(&self) {
        self.advance_system_state(SystemReportState::Reported);
    }

    pub fn mark_removed_from_system(&self) {
        self.advance_system_state(SystemReportState::Removed);
    }

    fn advance_system_state(&self, new_state: SystemReportState) {
        let Ok(mut state) = self.system_state.lock() else {
            return;
        };
        if new_state < *state {
            defect!(
                call_id = %self.id,
                current = ?*state,
                requested = ?new_state,
                "system report state may only move forward"
            );
            return;
        }
        if new_state == *state {
            tracing::debug!(call_id = %self.id, state = ?new_state, "system report state unchanged");
            return;
        }
        *state = new_state;
    }
}

impl Default for CommonCallState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_timestamp_recorded_once() {
        let common = CommonCallState::new();
        assert!(common.connected_at().is_none());

        assert!(common.set_connected_if_needed());
        let first = common.connected_at().unwrap();

        assert!(!common.set_connected_if_needed());
        assert_eq!(common.connected_at().unwrap(), first);
    }

    #[test]
    fn premature_duration_is_zero() {
        let common = CommonCallState::new();
        // debug_assert fires under cfg(debug_assertions); exercise the
        // release-mode defensive path only.
        if !cfg!(debug_assertions) {
            assert_eq!(common.connection_duration(), Duration::ZERO);
        }
    }

    #[test]
    fn system_state_is_forward_only() {
        let common = CommonCallState::new();
        assert_eq!(common.system_report_state(), SystemReportState::NotReported);

        common.mark_pending_report_to_system();
        common.mark_reported_to_system();
        assert_eq!(common.system_report_state(), SystemReportState::Reported);

        common.mark_removed_from_system();
        assert_eq!(common.system_report_state(), SystemReportState::Removed);
    }

    #[test]
    fn unreported_call_can_jump_to_removed() {
        let common = CommonCallState::new();
        common.mark_removed_from_system();
        assert_eq!(common.system_report_state(), SystemReportState::Removed);
    }
}
