//! Call model
//!
//! One [`Call`] per call attempt, shared as `Arc<Call>` everywhere.
//! Identity is object identity: membership and currency checks use
//! [`Arc::ptr_eq`], never payload comparison.

mod common;
mod group;
mod individual;

pub use common::{CommonCallState, SystemReportState};
pub use group::{GroupCall, GroupCallKind, GroupCallObserver, RingState};
pub use individual::{IndividualCall, IndividualCallObserver, IndividualCallState};

use std::sync::Arc;

use crate::error::defect;
use crate::types::{CallObjectId, JoinState, RemoteUserId};

/// The three call modes. The set is closed: matches over it are
/// exhaustive and adding a mode is a compile-visible change.
#[derive(Debug)]
pub enum CallMode {
    Individual(IndividualCall),
    GroupThread(GroupCall),
    CallLink(GroupCall),
}

/// One call of any mode.
#[derive(Debug)]
pub struct Call {
    common: CommonCallState,
    mode: CallMode,
}

impl Call {
    pub fn new_individual(individual: IndividualCall) -> Arc<Self> {
        Arc::new(Self {
            common: CommonCallState::new(),
            mode: CallMode::Individual(individual),
        })
    }

    /// Wrap a group call built for a group thread. The kind of the wrapped
    /// call must match; a mismatch is a defect and is stored as given.
    pub fn new_group_thread(group: GroupCall) -> Arc<Self> {
        if group.group_id().is_none() {
            defect!("group thread call built from a call-link session");
        }
        Arc::new(Self {
            common: CommonCallState::new(),
            mode: CallMode::GroupThread(group),
        })
    }

    pub fn new_call_link(group: GroupCall) -> Arc<Self> {
        if group.room_id().is_none() {
            defect!("call link call built from a group-thread session");
        }
        Arc::new(Self {
            common: CommonCallState::new(),
            mode: CallMode::CallLink(group),
        })
    }

    pub fn id(&self) -> CallObjectId {
        self.common.id()
    }

    pub fn common(&self) -> &CommonCallState {
        &self.common
    }

    pub fn mode(&self) -> &CallMode {
        &self.mode
    }

    pub fn is_individual(&self) -> bool {
        matches!(self.mode, CallMode::Individual(_))
    }

    /// The 1:1 call, if this is one.
    pub fn individual(&self) -> Option<&IndividualCall> {
        match &self.mode {
            CallMode::Individual(call) => Some(call),
            _ => None,
        }
    }

    /// The group call wrapper, for both group-thread and call-link calls.
    pub fn group(&self) -> Option<&GroupCall> {
        match &self.mode {
            CallMode::GroupThread(call) | CallMode::CallLink(call) => Some(call),
            CallMode::Individual(_) => None,
        }
    }

    /// Who is calling us, for calls that ring.
    pub fn caller(&self) -> Option<RemoteUserId> {
        match &self.mode {
            CallMode::Individual(call) => Some(call.remote()),
            CallMode::GroupThread(call) | CallMode::CallLink(call) => {
                match call.ring_state() {
                    RingState::IncomingRing { caller, .. } => Some(caller),
                    _ => None,
                }
            }
        }
    }

    /// Whether the call still accepts a local join or answer.
    pub fn can_join(&self) -> bool {
        match &self.mode {
            CallMode::Individual(call) => !call.is_ended(),
            CallMode::GroupThread(call) | CallMode::CallLink(call) => {
                call.join_state() == JoinState::NotJoined
            }
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match &self.mode {
            CallMode::Individual(_) => "individual",
            CallMode::GroupThread(_) => "group-thread",
            CallMode::CallLink(_) => "call-link",
        }
    }
}

impl std::fmt::Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Call({}, {})", self.id(), self.mode_name())
    }
}

/// Object-identity equality for calls.
pub fn is_same_call(a: &Arc<Call>, b: &Arc<Call>) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallMediaType, DeviceId};
    use uuid::Uuid;

    #[test]
    fn identity_is_by_object_not_payload() {
        let remote = RemoteUserId(Uuid::new_v4());
        let a = Call::new_individual(IndividualCall::outgoing(
            remote,
            CallMediaType::Audio,
            DeviceId(1),
        ));
        let b = Call::new_individual(IndividualCall::outgoing(
            remote,
            CallMediaType::Audio,
            DeviceId(1),
        ));
        assert!(is_same_call(&a, &Arc::clone(&a)));
        assert!(!is_same_call(&a, &b));
        assert_ne!(a.id(), b.id());
    }
}
