//! Error types for the call orchestration core

use thiserror::Error;

/// Result type for call orchestration operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can make a call non-viable, or that boundary operations report.
///
/// Local, recoverable conditions (a droppable ICE candidate that failed to
/// send, a transport retry) are absorbed where they are detected and never
/// show up here. Anything that funnels through `handle_failed_call` carries
/// one of these classifications so history records and notifications can
/// distinguish "missed", "timed out", and "identity changed".
#[derive(Debug, Error)]
pub enum CallError {
    /// The operation did not make progress before its deadline
    #[error("operation timed out: {description}")]
    Timeout { description: String },

    /// The calling engine reported a signaling failure
    #[error("signaling failure")]
    Signaling,

    /// The connection to the remote device was lost
    #[error("connection failure")]
    Disconnected,

    /// Network error while talking to a remote service
    #[error("network error: {reason}")]
    Network { reason: String },

    /// The recipient's cryptographic identity changed unexpectedly.
    /// Distinct from a plain transport failure because it may require an
    /// explicit user decision before any further sends can succeed.
    #[error("recipient identity is no longer trusted")]
    UntrustedIdentity,

    /// Microphone access was denied; the call cannot proceed
    #[error("microphone permission denied")]
    MicrophonePermissionDenied,

    /// An event referenced a call that is no longer the current call
    #[error("obsolete call: {description}")]
    ObsoleteCall { description: String },

    /// An internal invariant was violated. This indicates a logic bug,
    /// not a recoverable runtime condition.
    #[error("internal state violation: {description}")]
    Assertion { description: String },

    /// The calling engine reported an unrecoverable error
    #[error("calling engine error: {reason}")]
    Engine { reason: String },

    /// The call link was deleted locally and can no longer be joined
    #[error("call link has been deleted")]
    LinkDeleted,

    /// Error from a host-supplied collaborator
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl CallError {
    /// Create a timeout error
    pub fn timeout(description: impl Into<String>) -> Self {
        Self::Timeout {
            description: description.into(),
        }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    /// Create an obsolete-call error
    pub fn obsolete(description: impl Into<String>) -> Self {
        Self::ObsoleteCall {
            description: description.into(),
        }
    }

    /// Create an assertion error
    pub fn assertion(description: impl Into<String>) -> Self {
        Self::Assertion {
            description: description.into(),
        }
    }

    /// Create an engine error
    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    /// Whether a failed call should be dropped at the engine without sending
    /// a hangup message. Timeouts and stale calls never produced a usable
    /// signaling session, so a hangup would only confuse the remote side.
    pub fn should_silently_drop_call(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Signaling | Self::ObsoleteCall { .. }
        )
    }

    /// Whether this failure was caused by an unexpected identity change
    pub fn is_untrusted_identity(&self) -> bool {
        matches!(self, Self::UntrustedIdentity)
    }
}

/// Report a defect-level invariant violation.
///
/// Logs loudly and trips a debug assertion. Release builds tolerate the
/// violation and continue on the defensive path the caller provides.
macro_rules! defect {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        debug_assert!(false, "invariant violation, see error log");
    }};
}

pub(crate) use defect;
