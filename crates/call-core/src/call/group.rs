//! Group-thread and call-link call wrapper
//!
//! Wraps an engine-owned [`GroupSessionHandle`] and layers ring
//! bookkeeping, auto-mute policy, and termination intent on top. The same
//! wrapper backs both group-thread calls and call-link calls; the
//! [`GroupCallKind`] carries what differs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::engine::GroupSessionHandle;
use crate::link::CallLinkState;
use crate::observers::{ObserverHandle, ObserverSet};
use crate::types::{GroupEndReason, GroupId, JoinState, RemoteUserId, RingId, RoomId};

/// Ring progression of a group call, as seen from this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingState {
    /// This call will not ring anyone
    DoNotRing,
    /// Outgoing: ring once we have joined and nobody else is there yet
    ShouldRing,
    /// Outgoing: ring in progress
    Ringing,
    /// The ring concluded, by join or by a remote participant appearing
    RingingEnded,
    /// Incoming: someone is ringing us
    IncomingRing { caller: RemoteUserId, ring_id: RingId },
    /// Incoming: the ring was cancelled before we handled it
    IncomingRingCancelled,
}

impl RingState {
    pub fn incoming_ring_id(&self) -> Option<RingId> {
        match self {
            Self::IncomingRing { ring_id, .. } => Some(*ring_id),
            _ => None,
        }
    }
}

/// What distinguishes a group-thread call from a call-link call.
#[derive(Debug)]
pub enum GroupCallKind {
    Thread {
        group_id: GroupId,
        /// The group's announcement settings forbid ringing
        ring_restricted: bool,
    },
    Link {
        room_id: RoomId,
        admin_passkey: Option<Bytes>,
        /// Link metadata as of when the call was built; refreshed by peeks
        link_state: Mutex<CallLinkState>,
    },
}

/// Observer of one group call. All methods default to no-ops.
pub trait GroupCallObserver: Send + Sync {
    /// Local device state changed (join state, mute, ring bookkeeping).
    fn local_device_state_changed(&self, _call: &GroupCall) {}
    /// The set or state of remote devices changed.
    fn remote_device_states_changed(&self, _call: &GroupCall) {}
    /// A peek refreshed participant info.
    fn peek_changed(&self, _call: &GroupCall) {}
    fn call_ended(&self, _call: &GroupCall, _reason: &GroupEndReason) {}
    /// Sending a group update failed because a member's identity changed.
    fn untrusted_identity_error(&self, _call: &GroupCall) {}
}

/// One group-thread or call-link call.
pub struct GroupCall {
    handle: Arc<dyn GroupSessionHandle>,
    kind: GroupCallKind,
    ring_state: Mutex<RingState>,
    /// `connect` has been invoked on the session at least once
    has_invoked_connect: AtomicBool,
    /// Terminate the call object when the engine reports the session ended
    should_terminate_on_end: AtomicBool,
    /// Participant count from the most recent peek
    last_participant_count: AtomicUsize,
    auto_mute_threshold: usize,
    observers: ObserverSet<dyn GroupCallObserver>,
}

impl GroupCall {
    pub fn new_thread(
        handle: Arc<dyn GroupSessionHandle>,
        group_id: GroupId,
        ring_restricted: bool,
        auto_mute_threshold: usize,
    ) -> Self {
        Self::new(
            handle,
            GroupCallKind::Thread {
                group_id,
                ring_restricted,
            },
            auto_mute_threshold,
        )
    }

    pub fn new_link(
        handle: Arc<dyn GroupSessionHandle>,
        room_id: RoomId,
        admin_passkey: Option<Bytes>,
        link_state: CallLinkState,
        auto_mute_threshold: usize,
    ) -> Self {
        Self::new(
            handle,
            GroupCallKind::Link {
                room_id,
                admin_passkey,
                link_state: Mutex::new(link_state),
            },
            auto_mute_threshold,
        )
    }

    fn new(
        handle: Arc<dyn GroupSessionHandle>,
        kind: GroupCallKind,
        auto_mute_threshold: usize,
    ) -> Self {
        Self {
            handle,
            kind,
            ring_state: Mutex::new(RingState::DoNotRing),
            has_invoked_connect: AtomicBool::new(false),
            should_terminate_on_end: AtomicBool::new(false),
            last_participant_count: AtomicUsize::new(0),
            auto_mute_threshold,
            observers: ObserverSet::new(),
        }
    }

    pub fn handle(&self) -> &Arc<dyn GroupSessionHandle> {
        &self.handle
    }

    pub fn kind(&self) -> &GroupCallKind {
        &self.kind
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match &self.kind {
            GroupCallKind::Thread { group_id, .. } => Some(group_id),
            GroupCallKind::Link { .. } => None,
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match &self.kind {
            GroupCallKind::Thread { .. } => None,
            GroupCallKind::Link { room_id, .. } => Some(room_id),
        }
    }

    pub fn is_ring_restricted(&self) -> bool {
        match &self.kind {
            GroupCallKind::Thread { ring_restricted, .. } => *ring_restricted,
            // Call links have no rings at all
            GroupCallKind::Link { .. } => true,
        }
    }

    pub fn admin_passkey(&self) -> Option<Bytes> {
        match &self.kind {
            GroupCallKind::Thread { .. } => None,
            GroupCallKind::Link { admin_passkey, .. } => admin_passkey.clone(),
        }
    }

    pub fn link_state(&self) -> Option<CallLinkState> {
        match &self.kind {
            GroupCallKind::Thread { .. } => None,
            GroupCallKind::Link { link_state, .. } => {
                link_state.lock().ok().map(|guard| guard.clone())
            }
        }
    }

    pub fn set_link_state(&self, new_state: CallLinkState) {
        if let GroupCallKind::Link { link_state, .. } = &self.kind {
            if let Ok(mut guard) = link_state.lock() {
                *guard = new_state;
            }
        }
    }

    pub fn ring_state(&self) -> RingState {
        self.ring_state
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(RingState::DoNotRing)
    }

    pub fn set_ring_state(&self, new_state: RingState) {
        if let Ok(mut guard) = self.ring_state.lock() {
            tracing::debug!(from = ?*guard, to = ?new_state, "group ring state");
            *guard = new_state;
        }
    }

    pub fn join_state(&self) -> JoinState {
        self.handle.join_state()
    }

    /// `connect` has been invoked, so `disconnect` must be invoked before
    /// the call object is discarded.
    pub fn has_invoked_connect(&self) -> bool {
        self.has_invoked_connect.load(Ordering::SeqCst)
    }

    pub fn mark_connect_invoked(&self) {
        self.has_invoked_connect.store(true, Ordering::SeqCst);
    }

    pub fn should_terminate_on_end(&self) -> bool {
        self.should_terminate_on_end.load(Ordering::SeqCst)
    }

    pub fn set_should_terminate_on_end(&self, terminate: bool) {
        self.should_terminate_on_end.store(terminate, Ordering::SeqCst);
    }

    pub fn last_participant_count(&self) -> usize {
        self.last_participant_count.load(Ordering::SeqCst)
    }

    /// Whether a lobby for this call should start with the microphone
    /// muted: true when we have not joined yet and the call is already
    /// crowded.
    pub fn should_mute_automatically(&self) -> bool {
        self.join_state() != JoinState::Joined
            && self.last_participant_count() >= self.auto_mute_threshold
    }

    /// Engine callback: the local device state changed.
    ///
    /// If an incoming ring is pending and we have now joined, the ring
    /// concludes here, before observers see the local-state notification.
    pub fn on_local_device_state_changed(&self) {
        if self.join_state() == JoinState::Joined {
            if let Ok(mut ring) = self.ring_state.lock() {
                if matches!(*ring, RingState::IncomingRing { .. } | RingState::Ringing) {
                    *ring = RingState::RingingEnded;
                }
            }
        }
        self.observers.notify(|o| o.local_device_state_changed(self));
    }

    /// Engine callback: remote device states changed.
    ///
    /// An outgoing ring ends as soon as any remote device shows up. The
    /// ring transition and the local-state notification both land before
    /// the remote-state notification, so observers always see consistent
    /// ring state. Returns `true` when the ring ended on this event, which
    /// is the signal that someone accepted the ring.
    pub fn on_remote_device_states_changed(&self) -> bool {
        let mut ring_just_ended = false;
        if self.handle.remote_device_count() > 0 {
            if let Ok(mut ring) = self.ring_state.lock() {
                if *ring == RingState::Ringing {
                    *ring = RingState::RingingEnded;
                    ring_just_ended = true;
                }
            }
        }
        if ring_just_ended {
            self.observers.notify(|o| o.local_device_state_changed(self));
        }
        self.observers.notify(|o| o.remote_device_states_changed(self));
        ring_just_ended
    }

    /// Engine callback: a peek refreshed participant info.
    pub fn on_peek_changed(&self) {
        if let Some(count) = self.handle.peek_participant_count() {
            self.last_participant_count.store(count, Ordering::SeqCst);
        }
        self.observers.notify(|o| o.peek_changed(self));
    }

    /// Engine callback: the session ended.
    pub fn on_ended(&self, reason: &GroupEndReason) {
        self.observers.notify(|o| o.call_ended(self, reason));
    }

    /// A group update send failed because a member's identity changed.
    pub fn on_untrusted_identity_error(&self) {
        self.observers.notify(|o| o.untrusted_identity_error(self));
    }

    /// Register an observer. With `sync_immediately` the observer gets one
    /// synthetic local-state notification right away so it can render the
    /// current state without waiting for a change.
    pub fn add_observer(
        &self,
        observer: Arc<dyn GroupCallObserver>,
        sync_immediately: bool,
    ) -> ObserverHandle<dyn GroupCallObserver> {
        let handle = self.observers.add(Arc::clone(&observer));
        if sync_immediately {
            observer.local_device_state_changed(self);
        }
        handle
    }
}

impl std::fmt::Debug for GroupCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupCall")
            .field("kind", &self.kind)
            .field("ring_state", &self.ring_state())
            .field("join_state", &self.join_state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ConnectionState, DataMode};
    use uuid::Uuid;

    /// Scriptable stand-in for an engine group session.
    pub(crate) struct FakeSession {
        pub join_state: Mutex<JoinState>,
        pub connection_state: Mutex<ConnectionState>,
        pub remote_devices: AtomicUsize,
        pub peek_count: Mutex<Option<usize>>,
        pub audio_muted: AtomicBool,
        pub video_muted: AtomicBool,
        pub connect_ok: AtomicBool,
        pub connect_calls: AtomicUsize,
        pub join_calls: AtomicUsize,
        pub disconnect_calls: AtomicUsize,
        pub ring_all_calls: AtomicUsize,
    }

    impl FakeSession {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                join_state: Mutex::new(JoinState::NotJoined),
                connection_state: Mutex::new(ConnectionState::NotConnected),
                remote_devices: AtomicUsize::new(0),
                peek_count: Mutex::new(None),
                audio_muted: AtomicBool::new(false),
                video_muted: AtomicBool::new(false),
                connect_ok: AtomicBool::new(true),
                connect_calls: AtomicUsize::new(0),
                join_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                ring_all_calls: AtomicUsize::new(0),
            })
        }
    }

    impl GroupSessionHandle for FakeSession {
        fn connect(&self) -> bool {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.connect_ok.load(Ordering::SeqCst) {
                *self.connection_state.lock().unwrap() = ConnectionState::Connecting;
                true
            } else {
                false
            }
        }

        fn join(&self) {
            self.join_calls.fetch_add(1, Ordering::SeqCst);
            *self.join_state.lock().unwrap() = JoinState::Joined;
        }

        fn disconnect(&self) {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            *self.connection_state.lock().unwrap() = ConnectionState::NotConnected;
        }

        fn join_state(&self) -> JoinState {
            *self.join_state.lock().unwrap()
        }

        fn connection_state(&self) -> ConnectionState {
            *self.connection_state.lock().unwrap()
        }

        fn remote_device_count(&self) -> usize {
            self.remote_devices.load(Ordering::SeqCst)
        }

        fn peek_participant_count(&self) -> Option<usize> {
            *self.peek_count.lock().unwrap()
        }


        fn set_outgoing_audio_muted(&self, muted: bool) {
            self.audio_muted.store(muted, Ordering::SeqCst);
        }

        fn set_outgoing_video_muted(&self, muted: bool) {
            self.video_muted.store(muted, Ordering::SeqCst);
        }

        fn is_outgoing_audio_muted(&self) -> bool {
            self.audio_muted.load(Ordering::SeqCst)
        }

        fn is_outgoing_video_muted(&self) -> bool {
            self.video_muted.load(Ordering::SeqCst)
        }

        fn update_data_mode(&self, _data_mode: DataMode) {}

        fn ring_all(&self) {
            self.ring_all_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn thread_call(session: Arc<FakeSession>) -> GroupCall {
        GroupCall::new_thread(session, GroupId("g1".into()), false, 8)
    }

    #[test]
    fn outgoing_ring_ends_when_remote_joins() {
        let session = FakeSession::new();
        let call = thread_call(Arc::clone(&session));
        call.set_ring_state(RingState::Ringing);

        session.remote_devices.store(1, Ordering::SeqCst);
        assert!(call.on_remote_device_states_changed());
        assert_eq!(call.ring_state(), RingState::RingingEnded);

        // A second remote appearing is not a fresh accept.
        session.remote_devices.store(2, Ordering::SeqCst);
        assert!(!call.on_remote_device_states_changed());
    }

    #[test]
    fn ring_end_notifies_local_before_remote() {
        struct Order(Mutex<Vec<&'static str>>);
        impl GroupCallObserver for Order {
            fn local_device_state_changed(&self, call: &GroupCall) {
                assert_eq!(call.ring_state(), RingState::RingingEnded);
                self.0.lock().unwrap().push("local");
            }
            fn remote_device_states_changed(&self, _call: &GroupCall) {
                self.0.lock().unwrap().push("remote");
            }
        }

        let session = FakeSession::new();
        let call = thread_call(Arc::clone(&session));
        call.set_ring_state(RingState::Ringing);
        let order = Arc::new(Order(Mutex::new(Vec::new())));
        let _handle = call.add_observer(Arc::clone(&order) as _, false);

        session.remote_devices.store(1, Ordering::SeqCst);
        call.on_remote_device_states_changed();
        assert_eq!(*order.0.lock().unwrap(), vec!["local", "remote"]);
    }

    #[test]
    fn incoming_ring_ends_on_join() {
        let session = FakeSession::new();
        let call = thread_call(Arc::clone(&session));
        call.set_ring_state(RingState::IncomingRing {
            caller: RemoteUserId(Uuid::new_v4()),
            ring_id: RingId(3),
        });

        session.join();
        call.on_local_device_state_changed();
        assert_eq!(call.ring_state(), RingState::RingingEnded);
    }

    #[test]
    fn auto_mute_applies_to_crowded_unjoined_calls() {
        let session = FakeSession::new();
        let call = thread_call(Arc::clone(&session));

        *session.peek_count.lock().unwrap() = Some(8);
        call.on_peek_changed();
        assert!(call.should_mute_automatically());

        session.join();
        assert!(!call.should_mute_automatically());
    }

    #[test]
    fn sync_immediately_delivers_initial_snapshot() {
        struct Count(AtomicUsize);
        impl GroupCallObserver for Count {
            fn local_device_state_changed(&self, _call: &GroupCall) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let call = thread_call(FakeSession::new());
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let _handle = call.add_observer(Arc::clone(&count) as _, true);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
