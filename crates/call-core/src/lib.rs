//! # ringline-call-core
//!
//! Call session orchestration for direct (1:1), group-thread, and
//! call-link calls. This crate sits between a signaling transport, a
//! real-time media engine, and the host application's UI/telephony
//! surfaces, and owns the part none of them do: call lifecycle state
//! machines, the current-call slot, signaling dispatch, call link state
//! serialization, and the background link fetch loop.
//!
//! The crate moves no media and renders no UI. Hosts supply those
//! through the trait boundaries in [`engine`], [`signaling`], and
//! [`host`], and drive everything through one [`service::CallService`].
//!
//! ## Concurrency model
//!
//! Orchestration state is guarded by an explicit
//! [`context::OrchestrationContext`] token rather than a thread check:
//! mutations require the token the service was built with, and a
//! mismatch is a loudly logged defect. Observer fan-out is synchronous
//! and in registration order. Call link updates are serialized per room
//! through [`link::CallLinkStateUpdater`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use ringline_call_core::config::CallConfig;
//! use ringline_call_core::service::{CallService, CallServiceDependencies};
//! # fn wire() -> CallServiceDependencies { unimplemented!() }
//!
//! let service = CallService::new(CallConfig::default(), wire());
//! assert!(service.current_call().is_none());
//! ```

pub mod call;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod host;
pub mod link;
pub mod observers;
pub mod service;
pub mod signaling;
pub mod types;

pub use call::{Call, CallMode};
pub use config::CallConfig;
pub use context::OrchestrationContext;
pub use error::{CallError, CallResult};
pub use service::{CallService, CallServiceDependencies};
