//! Orchestration context token
//!
//! State that belongs to the orchestration domain (the current call, the
//! active-or-pending set, call state transitions) must only be mutated by
//! code holding the token the owning service was built with. The token is
//! plain data, so it can be cloned into spawned continuations; the
//! discipline it enforces is logical ownership, not thread identity.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Capability token for mutating orchestration-domain state.
///
/// Constructed once per service and passed explicitly into every mutating
/// call. A mismatched token is a defect: it is logged at error level and
/// trips a debug assertion, but release builds continue.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    id: u64,
}

impl OrchestrationContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Default for OrchestrationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_distinct() {
        let a = OrchestrationContext::new();
        let b = OrchestrationContext::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }
}
