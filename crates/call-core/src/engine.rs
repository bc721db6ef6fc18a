//! Boundary to the real-time calling engine
//!
//! The orchestration core never performs media or low-level signaling
//! itself. It issues commands through [`CallEngine`] and receives the
//! engine's lifecycle notifications as [`EngineEvent`]s routed back
//! through the call service.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::call::Call;
use crate::error::CallResult;
use crate::types::{
    CallId, CallMediaType, ConnectionState, DataMode, DeviceId, GroupId, HangupType, JoinState,
    RelayServer, RingCancelReason, RingId, RoomId,
};

/// Commands the orchestration core issues to the calling engine.
///
/// Command methods are synchronous from the caller's point of view; the
/// engine acknowledges progress asynchronously through [`EngineEvent`]s.
/// Errors returned here mean the command could not even be enqueued.
pub trait CallEngine: Send + Sync {
    /// Start an outgoing 1:1 call. The engine assigns a [`CallId`] and
    /// reports it through the should-start notification.
    fn place_call(
        &self,
        call: &Arc<Call>,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> CallResult<()>;

    /// Continue call setup once relay servers and routing policy are known.
    fn proceed(
        &self,
        call_id: CallId,
        relay_servers: Vec<RelayServer>,
        hide_ip: bool,
        data_mode: DataMode,
    ) -> CallResult<()>;

    /// Accept an incoming 1:1 call.
    fn accept(&self, call_id: CallId) -> CallResult<()>;

    /// Hang up the active 1:1 call, sending a hangup message.
    fn hangup(&self) -> CallResult<()>;

    /// Drop a call without sending a hangup message.
    fn drop_call(&self, call_id: CallId);

    /// Reset all engine state. Used when a call fails in a way that may
    /// have left the engine wedged.
    fn reset(&self);

    fn set_local_audio_enabled(&self, enabled: bool);

    fn update_data_mode(&self, data_mode: DataMode);

    // Inbound 1:1 signaling, forwarded verbatim from the transport.

    fn received_offer(
        &self,
        call: &Arc<Call>,
        call_id: CallId,
        source_device: DeviceId,
        opaque: Bytes,
        message_age: Duration,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> CallResult<()>;

    fn received_answer(
        &self,
        call: &Arc<Call>,
        call_id: CallId,
        source_device: DeviceId,
        opaque: Bytes,
    ) -> CallResult<()>;

    fn received_ice_candidates(
        &self,
        call: &Arc<Call>,
        call_id: CallId,
        source_device: DeviceId,
        candidates: Vec<Bytes>,
    ) -> CallResult<()>;

    fn received_hangup(
        &self,
        call: &Arc<Call>,
        call_id: CallId,
        source_device: DeviceId,
        hangup_type: HangupType,
        sender_device: DeviceId,
    ) -> CallResult<()>;

    fn received_busy(&self, call: &Arc<Call>, call_id: CallId, source_device: DeviceId)
        -> CallResult<()>;

    /// Tell the engine an outbound signaling message it requested was sent.
    fn signaling_message_did_send(&self, call_id: CallId) -> CallResult<()>;

    /// Tell the engine an outbound signaling message it requested failed.
    fn signaling_message_did_fail(&self, call_id: CallId);

    /// Create a session for a group-thread call. `None` means the engine
    /// could not build one (bad group state, resource exhaustion).
    fn create_group_session(&self, group_id: &GroupId) -> Option<Arc<dyn GroupSessionHandle>>;

    /// Create a session for a call-link call.
    fn create_call_link_session(
        &self,
        room_id: &RoomId,
        auth_presentation: Bytes,
        admin_passkey: Option<Bytes>,
    ) -> Option<Arc<dyn GroupSessionHandle>>;

    /// Cancel a group ring on the server. `reason` is `None` when the ring
    /// is merely discarded locally rather than declined.
    fn cancel_group_ring(
        &self,
        group_id: &GroupId,
        ring_id: RingId,
        reason: Option<RingCancelReason>,
    ) -> CallResult<()>;
}

/// Engine-owned session for one group or call-link call.
///
/// The orchestration core wraps one of these per group call and layers
/// ring state and termination policy on top.
pub trait GroupSessionHandle: Send + Sync {
    /// Connect media. Returns `false` if the connect could not start.
    fn connect(&self) -> bool;

    fn join(&self);

    fn disconnect(&self);

    fn join_state(&self) -> JoinState;

    fn connection_state(&self) -> ConnectionState;

    /// Number of remote devices currently in the call.
    fn remote_device_count(&self) -> usize;

    /// Participant count from the most recent peek, if any.
    fn peek_participant_count(&self) -> Option<usize>;


    fn set_outgoing_audio_muted(&self, muted: bool);

    fn set_outgoing_video_muted(&self, muted: bool);

    fn is_outgoing_audio_muted(&self) -> bool;

    fn is_outgoing_video_muted(&self) -> bool;

    fn update_data_mode(&self, data_mode: DataMode);

    /// Ring everyone in the group.
    fn ring_all(&self);
}

/// Lifecycle and remote-state notifications from the engine for 1:1 calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The local side is ringing (incoming call ready to present)
    RingingLocal,
    /// The remote side is ringing (outgoing call delivered)
    RingingRemote,
    /// Media connected, triggered by our accept
    ConnectedLocal,
    /// Media connected, triggered by the remote accept
    ConnectedRemote,
    EndedLocalHangup,
    EndedRemoteHangup,
    EndedRemoteHangupNeedPermission,
    /// Another of our devices accepted
    EndedRemoteHangupAccepted,
    /// Another of our devices declined
    EndedRemoteHangupDeclined,
    /// Another of our devices was busy
    EndedRemoteHangupBusy,
    EndedRemoteBusy,
    /// The remote placed a competing call that won glare resolution
    EndedRemoteGlare,
    /// The remote re-placed a call we thought was active
    EndedRemoteReCall,
    EndedTimeout,
    EndedSignalingFailure,
    EndedGlareHandlingFailure,
    EndedInternalFailure,
    EndedConnectionFailure,
    /// The engine dropped the call at our request
    EndedDropped,
    RemoteAudioEnable,
    RemoteAudioDisable,
    RemoteVideoEnable,
    RemoteVideoDisable,
    RemoteSharingScreenEnable,
    RemoteSharingScreenDisable,
    Reconnecting,
    Reconnected,
    /// The incoming offer was too old to handle
    ReceivedOfferExpired,
    /// An offer arrived while another call was active on this device
    ReceivedOfferWhileActive,
    /// An offer arrived that lost glare resolution
    ReceivedOfferWithGlare,
}
