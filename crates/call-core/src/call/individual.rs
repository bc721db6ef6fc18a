//! 1:1 call state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::task::AbortHandle;

use crate::error::{defect, CallError};
use crate::host::CallOutcome;
use crate::observers::{ObserverHandle, ObserverSet};
use crate::types::{CallDirection, CallId, CallMediaType, DeviceId, RemoteUserId};

/// State of a 1:1 call.
///
/// The local-ringing split mirrors how incoming calls are presented: the
/// engine declares the call ringable before the system call UI has
/// acknowledged it (`LocalRingingAnticipatory`), and only after the system
/// accepts the report can the user answer (`LocalRingingReadyToAnswer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndividualCallState {
    Idle,
    Dialing,
    Answering,
    RemoteRinging,
    LocalRingingAnticipatory,
    LocalRingingReadyToAnswer,
    /// The user accepted but the engine is not ready yet; resolved
    /// automatically once it is.
    Accepting,
    Connected,
    Reconnecting,
    // Terminal states. Once entered, the state never changes again.
    LocalFailure,
    LocalHangup,
    RemoteHangup,
    RemoteHangupNeedPermission,
    RemoteBusy,
    AnsweredElsewhere,
    DeclinedElsewhere,
    BusyElsewhere,
}

impl IndividualCallState {
    /// Whether this state ends the call. Terminal states are final: any
    /// attempted transition out of one is a defect and is ignored.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LocalFailure
                | Self::LocalHangup
                | Self::RemoteHangup
                | Self::RemoteHangupNeedPermission
                | Self::RemoteBusy
                | Self::AnsweredElsewhere
                | Self::DeclinedElsewhere
                | Self::BusyElsewhere
        )
    }

    /// States in which the call is ringing or being set up, before media
    /// ever connected.
    pub fn is_pre_connected(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::Dialing
                | Self::Answering
                | Self::RemoteRinging
                | Self::LocalRingingAnticipatory
                | Self::LocalRingingReadyToAnswer
                | Self::Accepting
        )
    }
}

/// Observer of one 1:1 call. All methods default to no-ops.
pub trait IndividualCallObserver: Send + Sync {
    fn state_did_change(&self, _call: &IndividualCall, _state: IndividualCallState) {}
    fn local_audio_mute_did_change(&self, _call: &IndividualCall, _muted: bool) {}
    fn local_video_mute_did_change(&self, _call: &IndividualCall, _muted: bool) {}
    fn remote_media_did_change(&self, _call: &IndividualCall) {}
}

/// A 1:1 call with one remote user.
pub struct IndividualCall {
    remote: RemoteUserId,
    direction: CallDirection,
    media_type: CallMediaType,
    local_device: DeviceId,

    call_id: Mutex<Option<CallId>>,
    state: Mutex<IndividualCallState>,
    error: Mutex<Option<CallError>>,
    outcome: Mutex<Option<CallOutcome>>,

    is_muted: AtomicBool,
    is_on_hold: AtomicBool,
    has_local_video: AtomicBool,
    is_remote_audio_muted: AtomicBool,
    is_remote_video_enabled: AtomicBool,
    is_remote_sharing_screen: AtomicBool,

    /// Abort handle for the incoming-offer grace timer, armed when an
    /// offer is received and cancelled once the call connects or ends.
    offer_deadline: Mutex<Option<AbortHandle>>,

    observers: ObserverSet<dyn IndividualCallObserver>,
}

impl IndividualCall {
    /// Build the local leg of an outgoing call. The engine assigns the
    /// call id later, via [`IndividualCall::set_outgoing_call_id`].
    pub fn outgoing(
        remote: RemoteUserId,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> Self {
        Self::new(remote, CallDirection::Outgoing, media_type, local_device, None)
    }

    /// Build the local leg of an incoming call from a received offer.
    pub fn incoming(
        remote: RemoteUserId,
        call_id: CallId,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> Self {
        Self::new(
            remote,
            CallDirection::Incoming,
            media_type,
            local_device,
            Some(call_id),
        )
    }

    fn new(
        remote: RemoteUserId,
        direction: CallDirection,
        media_type: CallMediaType,
        local_device: DeviceId,
        call_id: Option<CallId>,
    ) -> Self {
        let initial_state = match direction {
            CallDirection::Outgoing => IndividualCallState::Dialing,
            CallDirection::Incoming => IndividualCallState::Answering,
        };
        Self {
            remote,
            direction,
            media_type,
            local_device,
            call_id: Mutex::new(call_id),
            state: Mutex::new(initial_state),
            error: Mutex::new(None),
            outcome: Mutex::new(None),
            is_muted: AtomicBool::new(false),
            is_on_hold: AtomicBool::new(false),
            has_local_video: AtomicBool::new(media_type == CallMediaType::Video),
            is_remote_audio_muted: AtomicBool::new(false),
            is_remote_video_enabled: AtomicBool::new(false),
            is_remote_sharing_screen: AtomicBool::new(false),
            offer_deadline: Mutex::new(None),
            observers: ObserverSet::new(),
        }
    }

    pub fn remote(&self) -> RemoteUserId {
        self.remote
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn media_type(&self) -> CallMediaType {
        self.media_type
    }

    pub fn local_device(&self) -> DeviceId {
        self.local_device
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call_id.lock().ok().and_then(|guard| *guard)
    }

    /// Adopt the engine-assigned call id of an outgoing call. Assigning a
    /// second id is a defect and keeps the first.
    pub fn set_outgoing_call_id(&self, call_id: CallId) {
        let Ok(mut slot) = self.call_id.lock() else {
            return;
        };
        if let Some(existing) = *slot {
            defect!(%existing, requested = %call_id, "outgoing call id already assigned");
            return;
        }
        *slot = Some(call_id);
    }

    pub fn state(&self) -> IndividualCallState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(IndividualCallState::LocalFailure)
    }

    /// Transition the call to a new state and notify observers.
    ///
    /// Terminal states are final: a transition attempted after the call
    /// ended is a defect and is ignored, so late engine events can never
    /// resurrect an ended call.
    pub fn set_state(&self, new_state: IndividualCallState) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state == new_state {
                return;
            }
            if state.is_terminal() {
                defect!(
                    current = ?*state,
                    requested = ?new_state,
                    "transition out of a terminal call state"
                );
                return;
            }
            tracing::info!(from = ?*state, to = ?new_state, remote = %self.remote, "call state");
            *state = new_state;
        }
        self.observers.notify(|o| o.state_did_change(self, new_state));
    }

    /// Whether the call has reached a terminal state.
    pub fn is_ended(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn error(&self) -> Option<String> {
        self.error
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|e| e.to_string()))
    }

    pub fn set_error(&self, error: CallError) {
        if let Ok(mut slot) = self.error.lock() {
            *slot = Some(error);
        }
    }

    pub fn outcome(&self) -> Option<CallOutcome> {
        self.outcome.lock().ok().and_then(|guard| *guard)
    }

    /// Replace the history classification, returning the previous one.
    pub fn set_outcome(&self, outcome: CallOutcome) -> Option<CallOutcome> {
        self.outcome
            .lock()
            .map(|mut slot| slot.replace(outcome))
            .unwrap_or(None)
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::SeqCst)
    }

    pub fn set_is_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::SeqCst);
        self.observers.notify(|o| o.local_audio_mute_did_change(self, muted));
    }

    pub fn is_on_hold(&self) -> bool {
        self.is_on_hold.load(Ordering::SeqCst)
    }

    pub fn set_is_on_hold(&self, on_hold: bool) {
        self.is_on_hold.store(on_hold, Ordering::SeqCst);
    }

    pub fn has_local_video(&self) -> bool {
        self.has_local_video.load(Ordering::SeqCst)
    }

    pub fn set_has_local_video(&self, enabled: bool) {
        self.has_local_video.store(enabled, Ordering::SeqCst);
        self.observers.notify(|o| o.local_video_mute_did_change(self, !enabled));
    }

    pub fn is_remote_audio_muted(&self) -> bool {
        self.is_remote_audio_muted.load(Ordering::SeqCst)
    }

    pub fn set_is_remote_audio_muted(&self, muted: bool) {
        self.is_remote_audio_muted.store(muted, Ordering::SeqCst);
        self.observers.notify(|o| o.remote_media_did_change(self));
    }

    pub fn is_remote_video_enabled(&self) -> bool {
        self.is_remote_video_enabled.load(Ordering::SeqCst)
    }

    pub fn set_is_remote_video_enabled(&self, enabled: bool) {
        self.is_remote_video_enabled.store(enabled, Ordering::SeqCst);
        self.observers.notify(|o| o.remote_media_did_change(self));
    }

    pub fn is_remote_sharing_screen(&self) -> bool {
        self.is_remote_sharing_screen.load(Ordering::SeqCst)
    }

    pub fn set_is_remote_sharing_screen(&self, sharing: bool) {
        self.is_remote_sharing_screen.store(sharing, Ordering::SeqCst);
        self.observers.notify(|o| o.remote_media_did_change(self));
    }

    /// Arm the incoming-offer grace timer, replacing (and aborting) any
    /// previous one.
    pub fn set_offer_deadline(&self, handle: AbortHandle) {
        if let Ok(mut slot) = self.offer_deadline.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Cancel the incoming-offer grace timer if one is armed.
    pub fn clear_offer_deadline(&self) {
        if let Ok(mut slot) = self.offer_deadline.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    pub fn add_observer(
        &self,
        observer: std::sync::Arc<dyn IndividualCallObserver>,
    ) -> ObserverHandle<dyn IndividualCallObserver> {
        self.observers.add(observer)
    }
}

impl std::fmt::Debug for IndividualCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndividualCall")
            .field("remote", &self.remote)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("call_id", &self.call_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use uuid::Uuid;

    fn remote() -> RemoteUserId {
        RemoteUserId(Uuid::new_v4())
    }

    #[test]
    fn outgoing_call_starts_dialing() {
        let call = IndividualCall::outgoing(remote(), CallMediaType::Audio, DeviceId(1));
        assert_eq!(call.state(), IndividualCallState::Dialing);
        assert!(call.call_id().is_none());
    }

    #[test]
    fn incoming_call_starts_answering_with_id() {
        let call =
            IndividualCall::incoming(remote(), CallId(7), CallMediaType::Video, DeviceId(1));
        assert_eq!(call.state(), IndividualCallState::Answering);
        assert_eq!(call.call_id(), Some(CallId(7)));
        assert!(call.has_local_video());
    }

    #[test]
    fn terminal_states_are_final() {
        let call = IndividualCall::outgoing(remote(), CallMediaType::Audio, DeviceId(1));
        call.set_state(IndividualCallState::RemoteRinging);
        call.set_state(IndividualCallState::LocalHangup);
        assert!(call.is_ended());

        // A late engine event must not resurrect the call. The attempted
        // transition is a defect, so only exercise it in release builds
        // where debug assertions do not abort the test.
        if !cfg!(debug_assertions) {
            call.set_state(IndividualCallState::Connected);
            assert_eq!(call.state(), IndividualCallState::LocalHangup);
        }
    }

    #[test]
    fn state_changes_notify_observers_in_order() {
        struct Recorder(Mutex<Vec<IndividualCallState>>);
        impl IndividualCallObserver for Recorder {
            fn state_did_change(&self, _call: &IndividualCall, state: IndividualCallState) {
                self.0.lock().unwrap().push(state);
            }
        }

        let call = IndividualCall::outgoing(remote(), CallMediaType::Audio, DeviceId(1));
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let _handle = call.add_observer(Arc::clone(&recorder) as _);

        call.set_state(IndividualCallState::RemoteRinging);
        call.set_state(IndividualCallState::Connected);

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                IndividualCallState::RemoteRinging,
                IndividualCallState::Connected
            ]
        );
    }

    #[test]
    fn duplicate_state_does_not_notify() {
        struct Count(AtomicUsize);
        impl IndividualCallObserver for Count {
            fn state_did_change(&self, _call: &IndividualCall, _state: IndividualCallState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let call = IndividualCall::outgoing(remote(), CallMediaType::Audio, DeviceId(1));
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let _handle = call.add_observer(Arc::clone(&count) as _);

        call.set_state(IndividualCallState::RemoteRinging);
        call.set_state(IndividualCallState::RemoteRinging);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outcome_replacement_returns_previous() {
        let call = IndividualCall::outgoing(remote(), CallMediaType::Audio, DeviceId(1));
        assert_eq!(call.set_outcome(CallOutcome::OutgoingIncomplete), None);
        assert_eq!(
            call.set_outcome(CallOutcome::Outgoing),
            Some(CallOutcome::OutgoingIncomplete)
        );
    }
}
