//! Core identifier and enum types shared across the crate

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! fmt_display_via_inner {
    () => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    };
}

/// Process-local identity of a call object.
///
/// Two calls to the same conversation are still distinct objects with
/// distinct ids. Equality of calls everywhere in this crate is object
/// identity, never payload equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallObjectId(pub Uuid);

impl CallObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-level call identifier carried in signaling messages.
///
/// Assigned by the engine for outgoing calls and taken from the offer for
/// incoming calls. Not to be confused with [`CallObjectId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fmt_display_via_inner!();
}

/// Identifier of a call link room
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

impl fmt::Display for RoomId {
    fmt_display_via_inner!();
}

/// Identifier of a group conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fmt_display_via_inner!();
}

/// Stable identifier of a remote user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteUserId(pub Uuid);

impl fmt::Display for RemoteUserId {
    fmt_display_via_inner!();
}

/// One linked device of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fmt_display_via_inner!();
}

/// Identifier of one group ring attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RingId(pub i64);

impl fmt::Display for RingId {
    fmt_display_via_inner!();
}

/// Whether the local user initiated the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Media offered when the call was placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMediaType {
    Audio,
    Video,
}

/// Join progression of a group session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    Joining,
    /// Waiting for an admin to approve the join request
    Pending,
    Joined,
}

/// Media connection progression of a group session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Bandwidth posture requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMode {
    Low,
    Normal,
}

/// Delivery urgency of an outbound signaling message.
///
/// Droppable messages (ICE candidates) may be discarded by the transport
/// under pressure without making the call non-viable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingUrgency {
    Droppable,
    HandleImmediately,
}

/// Classification carried in a hangup signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangupType {
    Normal,
    /// Another device of ours accepted the call
    Accepted,
    /// Another device of ours declined the call
    Declined,
    /// Another device of ours was already busy
    Busy,
    /// The remote needs renewed permission before the call can proceed
    NeedPermission,
}

/// Why a user's ring for a group call should be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingCancelReason {
    DeclinedByUser,
    Busy,
}

/// Group ring notifications received over signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingUpdate {
    /// Someone is ringing the group
    Requested,
    /// The ring expired without being handled
    ExpiredRing,
    AcceptedOnAnotherDevice,
    DeclinedOnAnotherDevice,
    BusyLocally,
    BusyOnAnotherDevice,
    CancelledByRinger,
}

/// Why a group session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEndReason {
    DeviceExplicitlyDisconnected,
    ServerExplicitlyDisconnected,
    DeniedRequestToJoin,
    RemovedFromCall,
    HasMaxDevices,
    Failed(String),
}

impl GroupEndReason {
    /// Ends that reflect normal teardown rather than an error
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::DeviceExplicitlyDisconnected)
    }
}

/// One relay (TURN) server usable for media routing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Opaque credential presented when reading or mutating call link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCredential(pub bytes::Bytes);
