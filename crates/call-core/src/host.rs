//! Host application boundaries
//!
//! Everything the orchestration core needs from the embedding application
//! lives behind the traits in this module: the OS telephony surface, call
//! history, user-facing notifications, routing policy, and relay
//! credentials. Hosts implement what they need; UI notification methods
//! default to no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::call::Call;
use crate::error::{CallError, CallResult};
use crate::types::{GroupId, RelayServer, RemoteUserId};

/// The operating system's telephony surface (incoming call UI, audio
/// session ownership). Invocations are paired 1:1 with the reported-state
/// transitions on [`crate::call::CommonCallState`].
pub trait SystemCallReporter: Send + Sync {
    fn call_started(&self, call: &Arc<Call>);
    fn call_ended(&self, call: &Arc<Call>);
}

/// How a finished call is classified in call history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// Outgoing call placed but not yet answered
    OutgoingIncomplete,
    /// Outgoing call that connected
    Outgoing,
    /// Outgoing call that was never answered
    OutgoingMissed,
    /// Incoming call received but not yet answered
    IncomingIncomplete,
    /// Incoming call that connected
    Incoming,
    IncomingMissed,
    IncomingDeclined,
    IncomingAnsweredElsewhere,
    IncomingDeclinedElsewhere,
    IncomingBusyElsewhere,
    /// Missed because the caller needs renewed permission to reach us
    IncomingMissedBecausePermission,
}

impl CallOutcome {
    /// Outcomes a missed-call notification should be shown for.
    pub fn counts_as_missed(&self) -> bool {
        matches!(
            self,
            Self::IncomingMissed | Self::IncomingMissedBecausePermission
        )
    }
}

/// Durable call history.
pub trait CallHistorySink: Send + Sync {
    /// Record or replace the outcome of a call. Called once when a call is
    /// created and again whenever its classification changes.
    fn record_outcome(&self, call: &Arc<Call>, outcome: CallOutcome);
}

/// User-facing call notifications. All methods default to no-ops so hosts
/// only implement the surface they present.
pub trait CallUiDelegate: Send + Sync {
    fn report_incoming_call(&self, _call: &Arc<Call>) {}
    fn start_outgoing_call(&self, _call: &Arc<Call>) {}
    /// The remote side (or the ringed group) accepted.
    fn recipient_accepted(&self, _call: &Arc<Call>) {}
    fn remote_did_hangup(&self, _call: &Arc<Call>) {}
    fn remote_busy(&self, _call: &Arc<Call>) {}
    fn report_missed_call(&self, _call: &Arc<Call>, _outcome: CallOutcome) {}
    fn fail_call(&self, _call: &Arc<Call>, _error: &CallError) {}
    fn did_answer_elsewhere(&self, _call: &Arc<Call>) {}
    fn did_decline_elsewhere(&self, _call: &Arc<Call>) {}
    fn was_busy_elsewhere(&self, _call: &Arc<Call>) {}
}

/// Routing and ring policy decided by the host.
pub trait CallPolicy: Send + Sync {
    /// Whether the remote user is a recognized contact. Unrecognized peers
    /// get relay-only routing so our IP address is not exposed to them.
    fn is_recognized_peer(&self, remote: &RemoteUserId) -> bool;

    /// Whether the user asked to hide their IP on every call.
    fn hide_ip_for_all_calls(&self) -> bool;

    /// Whether the user prefers low-bandwidth media.
    fn prefer_low_data(&self) -> bool;

    /// Whether an incoming ring for this group from this sender should be
    /// honored (membership, block list, group size).
    fn group_ring_allowed(&self, group_id: &GroupId, sender: &RemoteUserId) -> bool;
}

/// Source of relay (TURN) servers for direct calls.
#[async_trait]
pub trait RelayCredentialProvider: Send + Sync {
    async fn relay_servers(&self) -> CallResult<Vec<RelayServer>>;
}
