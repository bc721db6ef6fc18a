//! Background call link fetch loop
//!
//! Link records can be flagged as needing a fetch by writes that arrive
//! while the app is not in a position to fetch (sync messages, pushes).
//! One background task drains that backlog: at most one loop runs at a
//! time, fetches go oldest first, and consecutive failures back off
//! exponentially so an unreachable server cannot spin the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::FetchBackoff;
use crate::link::store::CallLinkRecordStore;
use crate::link::updater::CallLinkStateUpdater;

/// Single-flight driver of pending call link fetches.
pub struct CallLinkFetchJob {
    updater: Arc<CallLinkStateUpdater>,
    store: Arc<dyn CallLinkRecordStore>,
    backoff: FetchBackoff,
    /// A drain loop is currently running
    is_fetching: AtomicBool,
    /// Set by signals that arrive while a loop is running, so the loop
    /// re-checks the queue before exiting instead of losing the wakeup.
    might_have_pending_fetch: AtomicBool,
}

impl CallLinkFetchJob {
    pub fn new(
        updater: Arc<CallLinkStateUpdater>,
        store: Arc<dyn CallLinkRecordStore>,
        backoff: FetchBackoff,
    ) -> Arc<Self> {
        Arc::new(Self {
            updater,
            store,
            backoff,
            is_fetching: AtomicBool::new(false),
            might_have_pending_fetch: AtomicBool::new(false),
        })
    }

    /// Hint that some record may now need a fetch. Cheap to call
    /// spuriously; starts the drain loop only if one is not running.
    pub fn signal_might_have_pending_fetch(self: &Arc<Self>) {
        self.might_have_pending_fetch.store(true, Ordering::SeqCst);
        self.spawn_if_idle();
    }

    fn spawn_if_idle(self: &Arc<Self>) {
        if self
            .is_fetching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let job = Arc::clone(self);
            tokio::spawn(async move { job.run().await });
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.might_have_pending_fetch.store(false, Ordering::SeqCst);
            self.drain_queue().await;
            self.is_fetching.store(false, Ordering::SeqCst);

            // A signal that raced the drain would otherwise be lost: its
            // spawn_if_idle saw is_fetching still true.
            if !self.might_have_pending_fetch.load(Ordering::SeqCst) {
                return;
            }
            if self
                .is_fetching
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                // Another signal already restarted the loop.
                return;
            }
        }
    }

    /// Fetch pending records oldest first until the queue is empty,
    /// sleeping between consecutive failures.
    pub(crate) async fn drain_queue(&self) {
        let mut failure_count = 0u32;
        while let Some(record) = self.store.next_pending_fetch() {
            match self.updater.read_call_link(&record.room_id).await {
                Ok(_) => {
                    failure_count = 0;
                }
                Err(error) => {
                    failure_count += 1;
                    let delay = self.backoff.delay(failure_count);
                    tracing::warn!(
                        room_id = %record.room_id,
                        %error,
                        failure_count,
                        ?delay,
                        "call link fetch failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::store::{CallLinkRecord, InMemoryCallLinkStore};
    use crate::link::updater::tests::{updater_with_store, FakeFetcher};
    use crate::types::RoomId;
    use std::time::Duration;
    use tokio::time::Instant;

    fn room(name: &str) -> RoomId {
        RoomId(name.to_string())
    }

    fn job_with(
        store: Arc<InMemoryCallLinkStore>,
        fetcher: Arc<FakeFetcher>,
        backoff: FetchBackoff,
    ) -> Arc<CallLinkFetchJob> {
        let updater = updater_with_store(Arc::clone(&store) as _, fetcher);
        CallLinkFetchJob::new(updater, store, backoff)
    }

    #[tokio::test(start_paused = true)]
    async fn drains_pending_records_oldest_first() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        store.upsert(CallLinkRecord::new(room("b"), None));
        store.mark_pending_fetch(&room("a"));
        store.mark_pending_fetch(&room("b"));

        let fetcher = Arc::new(FakeFetcher::new());
        let job = job_with(Arc::clone(&store), Arc::clone(&fetcher), FetchBackoff::default());

        job.drain_queue().await;
        assert_eq!(fetcher.reads.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(!store.get(&room("a")).unwrap().needs_fetch());
        assert!(!store.get(&room("b")).unwrap().needs_fetch());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_growing_backoff_then_succeeds() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        store.mark_pending_fetch(&room("a"));

        let fetcher = Arc::new(FakeFetcher::new());
        fetcher
            .fail_first
            .store(3, std::sync::atomic::Ordering::SeqCst);
        let backoff = FetchBackoff::default();
        let job = job_with(Arc::clone(&store), Arc::clone(&fetcher), backoff.clone());

        let started = Instant::now();
        job.drain_queue().await;

        // Three failures sleep d(1) + d(2) + d(3); the fourth attempt
        // clears the record. Paused time advances exactly the slept total.
        let expected: Duration = backoff.delay(1) + backoff.delay(2) + backoff.delay(3);
        assert_eq!(started.elapsed(), expected);
        assert_eq!(fetcher.reads.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert!(!store.get(&room("a")).unwrap().needs_fetch());
    }

    #[tokio::test(start_paused = true)]
    async fn signal_during_drain_is_not_lost() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        store.upsert(CallLinkRecord::new(room("b"), None));
        store.mark_pending_fetch(&room("a"));

        let fetcher = Arc::new(FakeFetcher::new());
        let job = job_with(Arc::clone(&store), Arc::clone(&fetcher), FetchBackoff::default());

        job.signal_might_have_pending_fetch();
        // Flag a second record while the first drain may still be running.
        store.mark_pending_fetch(&room("b"));
        job.signal_might_have_pending_fetch();

        // Let the spawned loop(s) run to completion.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!store.get(&room("a")).unwrap().needs_fetch());
        assert!(!store.get(&room("b")).unwrap().needs_fetch());
    }
}
