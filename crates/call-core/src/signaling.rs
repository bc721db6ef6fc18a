//! Outbound signaling transport boundary
//!
//! Sends requested by the engine are dispatched through a host-supplied
//! [`SignalingSender`]. Sends are fire-and-forget from the orchestration
//! core's point of view; completion is reported back to the engine, not to
//! the caller.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::CallError;
use crate::types::{
    CallId, CallMediaType, DeviceId, GroupId, HangupType, RemoteUserId, SignalingUrgency,
};

/// Failure modes of an outbound signaling send.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("network error sending call message: {reason}")]
    Network { reason: String },

    #[error("timed out sending call message")]
    Timeout,

    /// The recipient's identity key changed. Surfaced separately from plain
    /// network failures so callers can prompt for a trust decision.
    #[error("recipient identity is untrusted")]
    UntrustedIdentity,
}

impl From<SignalingError> for CallError {
    fn from(error: SignalingError) -> Self {
        match error {
            SignalingError::Network { reason } => CallError::Network { reason },
            SignalingError::Timeout => CallError::timeout("signaling send"),
            SignalingError::UntrustedIdentity => CallError::UntrustedIdentity,
        }
    }
}

/// One outbound 1:1 call message.
#[derive(Debug, Clone)]
pub enum SignalPayload {
    Offer {
        call_id: CallId,
        media_type: CallMediaType,
        opaque: Bytes,
    },
    Answer {
        call_id: CallId,
        opaque: Bytes,
    },
    IceUpdates {
        call_id: CallId,
        candidates: Vec<Bytes>,
    },
    Hangup {
        call_id: CallId,
        hangup_type: HangupType,
        sender_device: DeviceId,
    },
    Busy {
        call_id: CallId,
    },
    /// Engine-defined message the core does not interpret.
    Opaque {
        data: Bytes,
    },
}

impl SignalPayload {
    /// Call id this payload belongs to, if it targets a specific call.
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceUpdates { call_id, .. }
            | Self::Hangup { call_id, .. }
            | Self::Busy { call_id } => Some(*call_id),
            Self::Opaque { .. } => None,
        }
    }
}

/// Host-supplied transport for outbound call messages.
#[async_trait]
pub trait SignalingSender: Send + Sync {
    /// Send a call message to one user, or to one specific device of that
    /// user when `destination_device` is set.
    async fn send_call_message(
        &self,
        recipient: RemoteUserId,
        destination_device: Option<DeviceId>,
        urgency: SignalingUrgency,
        payload: SignalPayload,
    ) -> Result<(), SignalingError>;

    /// Send an opaque group call update to a group, restricted to
    /// `override_recipients` when non-empty.
    async fn send_group_call_message(
        &self,
        group_id: GroupId,
        urgency: SignalingUrgency,
        payload: Bytes,
        override_recipients: Vec<RemoteUserId>,
    ) -> Result<(), SignalingError>;
}
