//! Shared call service state
//!
//! Holds the current call and the set of active-or-pending calls, and
//! fans out current-call changes to observers. Mutations require the
//! orchestration context token the state was built with; the tracked set
//! may be read from any task.

use std::sync::{Arc, Mutex};

use crate::call::{is_same_call, Call, CallMode};
use crate::context::OrchestrationContext;
use crate::error::defect;
use crate::host::SystemCallReporter;
use crate::observers::{ObserverHandle, ObserverSet};

/// Observer of the current-call slot.
pub trait CallObserver: Send + Sync {
    /// The current call changed from `old` to `new`. Delivered
    /// synchronously, in registration order, on the mutating caller.
    fn did_update_call(&self, old: Option<&Arc<Call>>, new: Option<&Arc<Call>>);
}

/// Delegate notified after a call has been fully terminated.
pub trait CallServiceDelegate: Send + Sync {
    fn did_terminate_call(&self, call: &Arc<Call>);
}

/// The call service's mutable state.
pub struct CallServiceState {
    context_id: u64,
    /// The one call presented to the user, if any. Always a member of
    /// `active_or_pending`.
    current_call: Mutex<Option<Arc<Call>>>,
    /// Every call not yet terminated, current or not.
    active_or_pending: Mutex<Vec<Arc<Call>>>,
    observers: ObserverSet<dyn CallObserver>,
    delegate: Mutex<Option<Arc<dyn CallServiceDelegate>>>,
    system_reporter: Arc<dyn SystemCallReporter>,
}

impl CallServiceState {
    pub fn new(
        ctx: &OrchestrationContext,
        system_reporter: Arc<dyn SystemCallReporter>,
    ) -> Self {
        Self {
            context_id: ctx.id(),
            current_call: Mutex::new(None),
            active_or_pending: Mutex::new(Vec::new()),
            observers: ObserverSet::new(),
            delegate: Mutex::new(None),
            system_reporter,
        }
    }

    /// Verify the caller holds the right context token. A mismatch is a
    /// defect; release builds proceed anyway.
    fn check_context(&self, ctx: &OrchestrationContext) {
        if ctx.id() != self.context_id {
            defect!(
                expected = self.context_id,
                got = ctx.id(),
                "call state touched with a foreign orchestration context"
            );
        }
    }

    pub fn set_delegate(&self, delegate: Arc<dyn CallServiceDelegate>) {
        if let Ok(mut slot) = self.delegate.lock() {
            *slot = Some(delegate);
        }
    }

    pub fn current_call(&self, ctx: &OrchestrationContext) -> Option<Arc<Call>> {
        self.check_context(ctx);
        self.current_call.lock().ok().and_then(|guard| guard.clone())
    }

    /// Whether `call` is the current call.
    pub fn is_current(&self, ctx: &OrchestrationContext, call: &Arc<Call>) -> bool {
        self.current_call(ctx)
            .map(|current| is_same_call(&current, call))
            .unwrap_or(false)
    }

    /// Replace the current call and notify observers.
    ///
    /// A non-null current call must already be tracked in the
    /// active-or-pending set; promoting an untracked call is a defect
    /// (the call is promoted anyway so the user is not left without UI).
    pub fn set_current_call(&self, ctx: &OrchestrationContext, new: Option<Arc<Call>>) {
        self.check_context(ctx);
        if let Some(call) = &new {
            if !self.is_tracked(call) {
                defect!(%call, "current call is not in the active-or-pending set");
            }
        }
        let old = {
            let Ok(mut slot) = self.current_call.lock() else {
                return;
            };
            std::mem::replace(&mut *slot, new.clone())
        };
        let unchanged = match (&old, &new) {
            (None, None) => true,
            (Some(a), Some(b)) => is_same_call(a, b),
            _ => false,
        };
        if unchanged {
            return;
        }
        tracing::info!(
            old = old.as_ref().map(|c| c.to_string()),
            new = new.as_ref().map(|c| c.to_string()),
            "current call changed"
        );
        self.observers
            .notify(|o| o.did_update_call(old.as_ref(), new.as_ref()));
    }

    /// Start tracking a call in the active-or-pending set.
    pub fn add_call(&self, ctx: &OrchestrationContext, call: Arc<Call>) {
        self.check_context(ctx);
        let Ok(mut calls) = self.active_or_pending.lock() else {
            return;
        };
        if calls.iter().any(|tracked| is_same_call(tracked, &call)) {
            defect!(%call, "call added to the active-or-pending set twice");
            return;
        }
        tracing::info!(%call, "tracking call");
        calls.push(call);
    }

    /// Whether the call is in the active-or-pending set. Readable from
    /// any task.
    pub fn is_tracked(&self, call: &Arc<Call>) -> bool {
        self.active_or_pending
            .lock()
            .map(|calls| calls.iter().any(|tracked| is_same_call(tracked, call)))
            .unwrap_or(false)
    }

    /// Whether any call is active or pending. Readable from any task.
    pub fn has_any_call(&self) -> bool {
        self.active_or_pending
            .lock()
            .map(|calls| !calls.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of the active-or-pending set. Readable from any task.
    pub fn active_or_pending_calls(&self) -> Vec<Arc<Call>> {
        self.active_or_pending
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    /// Tear a call down and stop tracking it. Idempotent: terminating a
    /// call that was already terminated logs and returns.
    ///
    /// Clears the current-call slot first (observers see the change while
    /// the set still contains the call), then unregisters the call from
    /// the telephony surface, disconnects group media if it was ever
    /// connected, and finally notifies the delegate.
    pub fn terminate_call(&self, ctx: &OrchestrationContext, call: &Arc<Call>) {
        self.check_context(ctx);
        if !self.is_tracked(call) {
            tracing::info!(%call, "ignoring termination of an untracked call");
            return;
        }
        tracing::info!(%call, "terminating call");

        if self.is_current(ctx, call) {
            self.set_current_call(ctx, None);
        }
        if let Ok(mut calls) = self.active_or_pending.lock() {
            calls.retain(|tracked| !is_same_call(tracked, call));
        }

        match call.mode() {
            CallMode::GroupThread(group) | CallMode::CallLink(group) => {
                // Safety net: the owning service normally disconnects
                // before terminating.
                if group.has_invoked_connect() {
                    group.handle().disconnect();
                }
            }
            CallMode::Individual(individual) => {
                individual.clear_offer_deadline();
            }
        }

        call.common().mark_removed_from_system();
        self.system_reporter.call_ended(call);

        let delegate = self.delegate.lock().ok().and_then(|slot| slot.clone());
        if let Some(delegate) = delegate {
            delegate.did_terminate_call(call);
        }
    }

    /// Register a current-call observer. With `sync_immediately` the
    /// observer receives one synthetic notification carrying the current
    /// state right away.
    pub fn add_observer(
        &self,
        ctx: &OrchestrationContext,
        observer: Arc<dyn CallObserver>,
        sync_immediately: bool,
    ) -> ObserverHandle<dyn CallObserver> {
        let handle = self.observers.add(Arc::clone(&observer));
        if sync_immediately {
            let current = self.current_call(ctx);
            observer.did_update_call(None, current.as_ref());
        }
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::IndividualCall;
    use crate::types::{CallMediaType, DeviceId, RemoteUserId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct NullReporter;
    impl SystemCallReporter for NullReporter {
        fn call_started(&self, _call: &Arc<Call>) {}
        fn call_ended(&self, _call: &Arc<Call>) {}
    }

    fn new_state(ctx: &OrchestrationContext) -> CallServiceState {
        CallServiceState::new(ctx, Arc::new(NullReporter))
    }

    fn new_call() -> Arc<Call> {
        Call::new_individual(IndividualCall::outgoing(
            RemoteUserId(Uuid::new_v4()),
            CallMediaType::Audio,
            DeviceId(1),
        ))
    }

    #[test]
    fn current_call_stays_in_tracked_set() {
        let ctx = OrchestrationContext::new();
        let state = new_state(&ctx);
        let call = new_call();

        state.add_call(&ctx, Arc::clone(&call));
        state.set_current_call(&ctx, Some(Arc::clone(&call)));
        assert!(state.is_current(&ctx, &call));
        assert!(state.is_tracked(&call));

        state.terminate_call(&ctx, &call);
        assert!(state.current_call(&ctx).is_none());
        assert!(!state.is_tracked(&call));
        assert!(!state.has_any_call());
    }

    #[test]
    fn terminate_is_idempotent() {
        struct CountingDelegate(AtomicUsize);
        impl CallServiceDelegate for CountingDelegate {
            fn did_terminate_call(&self, _call: &Arc<Call>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let ctx = OrchestrationContext::new();
        let state = new_state(&ctx);
        let delegate = Arc::new(CountingDelegate(AtomicUsize::new(0)));
        state.set_delegate(Arc::clone(&delegate) as _);

        let call = new_call();
        state.add_call(&ctx, Arc::clone(&call));
        state.terminate_call(&ctx, &call);
        state.terminate_call(&ctx, &call);
        assert_eq!(delegate.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_see_old_and_new_in_order() {
        struct Recorder(Mutex<Vec<(Option<String>, Option<String>)>>);
        impl CallObserver for Recorder {
            fn did_update_call(&self, old: Option<&Arc<Call>>, new: Option<&Arc<Call>>) {
                self.0.lock().unwrap().push((
                    old.map(|c| c.to_string()),
                    new.map(|c| c.to_string()),
                ));
            }
        }

        let ctx = OrchestrationContext::new();
        let state = new_state(&ctx);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let _handle = state.add_observer(&ctx, Arc::clone(&recorder) as _, false);

        let call = new_call();
        state.add_call(&ctx, Arc::clone(&call));
        state.set_current_call(&ctx, Some(Arc::clone(&call)));
        state.set_current_call(&ctx, None);

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, None);
        assert_eq!(seen[0].1, Some(call.to_string()));
        assert_eq!(seen[1].0, Some(call.to_string()));
        assert_eq!(seen[1].1, None);
    }

    #[test]
    fn sync_immediately_delivers_current_snapshot() {
        struct Latest(Mutex<Option<Option<String>>>);
        impl CallObserver for Latest {
            fn did_update_call(&self, _old: Option<&Arc<Call>>, new: Option<&Arc<Call>>) {
                *self.0.lock().unwrap() = Some(new.map(|c| c.to_string()));
            }
        }

        let ctx = OrchestrationContext::new();
        let state = new_state(&ctx);
        let call = new_call();
        state.add_call(&ctx, Arc::clone(&call));
        state.set_current_call(&ctx, Some(Arc::clone(&call)));

        let latest = Arc::new(Latest(Mutex::new(None)));
        let _handle = state.add_observer(&ctx, Arc::clone(&latest) as _, true);
        assert_eq!(*latest.0.lock().unwrap(), Some(Some(call.to_string())));
    }

    #[test]
    fn setting_same_current_call_does_not_notify() {
        struct Count(AtomicUsize);
        impl CallObserver for Count {
            fn did_update_call(&self, _old: Option<&Arc<Call>>, _new: Option<&Arc<Call>>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let ctx = OrchestrationContext::new();
        let state = new_state(&ctx);
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let _handle = state.add_observer(&ctx, Arc::clone(&count) as _, false);

        let call = new_call();
        state.add_call(&ctx, Arc::clone(&call));
        state.set_current_call(&ctx, Some(Arc::clone(&call)));
        state.set_current_call(&ctx, Some(Arc::clone(&call)));
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
