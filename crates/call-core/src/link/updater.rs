//! Serialized call link updates
//!
//! All reads and writes of one call link's state flow through
//! [`CallLinkStateUpdater::update_exclusively`], which runs at most one
//! operation per room at a time and queues the rest in FIFO order.
//! Operations on different rooms never block each other. This is an
//! explicit per-key mutex: one fair async lock per room id, held through
//! an owned guard so a queued waiter that is cancelled (even after being
//! handed the room) releases it like any other holder.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;

use crate::error::{CallError, CallResult};
use crate::link::store::{CallLinkRecord, CallLinkRecordStore, CallLinkState};
use crate::types::{AuthCredential, RoomId};

/// Read access to call link state on the server.
#[async_trait]
pub trait CallLinkStateFetcher: Send + Sync {
    async fn read(&self, room_id: &RoomId, auth: &AuthCredential) -> CallResult<CallLinkState>;
}

/// Admin mutations of call link state on the server.
#[async_trait]
pub trait CallLinkAdminApi: Send + Sync {
    async fn update_name(
        &self,
        room_id: &RoomId,
        auth: &AuthCredential,
        admin_passkey: &Bytes,
        name: &str,
    ) -> CallResult<CallLinkState>;

    async fn update_restrictions(
        &self,
        room_id: &RoomId,
        auth: &AuthCredential,
        admin_passkey: &Bytes,
        requires_admin_approval: bool,
    ) -> CallResult<CallLinkState>;

    async fn delete(
        &self,
        room_id: &RoomId,
        auth: &AuthCredential,
        admin_passkey: &Bytes,
    ) -> CallResult<()>;
}

/// Source of the credential presented with every link operation.
#[async_trait]
pub trait AuthCredentialProvider: Send + Sync {
    async fn call_link_auth_credential(&self) -> CallResult<AuthCredential>;
}

type RoomLocks = Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>;

/// Serializer for call link state operations.
pub struct CallLinkStateUpdater {
    store: Arc<dyn CallLinkRecordStore>,
    fetcher: Arc<dyn CallLinkStateFetcher>,
    admin: Arc<dyn CallLinkAdminApi>,
    auth: Arc<dyn AuthCredentialProvider>,
    /// One fair async lock per room that has (or recently had) an
    /// operation in flight. Idle entries are pruned on the next acquire.
    room_locks: RoomLocks,
}

impl CallLinkStateUpdater {
    pub fn new(
        store: Arc<dyn CallLinkRecordStore>,
        fetcher: Arc<dyn CallLinkStateFetcher>,
        admin: Arc<dyn CallLinkAdminApi>,
        auth: Arc<dyn AuthCredentialProvider>,
    ) -> Self {
        Self {
            store,
            fetcher,
            admin,
            auth,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CallLinkRecordStore> {
        &self.store
    }

    pub fn auth_provider(&self) -> &Arc<dyn AuthCredentialProvider> {
        &self.auth
    }

    /// Run `operation` with exclusive access to the room's link state.
    ///
    /// The operation receives the current record (if any) and a fresh auth
    /// credential, and returns the new server state. On success the state
    /// is persisted, but only if a record still exists for the room, and
    /// the room's needs-fetch flag is cleared only if no invalidating
    /// write landed while the operation ran. The room is released to the
    /// next queued waiter whether the operation succeeds or fails.
    ///
    /// Dropping the returned future mid-operation releases the room; the
    /// server-side effects of an abandoned operation may still land.
    pub async fn update_exclusively<F, Fut>(
        &self,
        room_id: &RoomId,
        operation: F,
    ) -> CallResult<CallLinkState>
    where
        F: FnOnce(Option<CallLinkRecord>, AuthCredential) -> Fut,
        Fut: Future<Output = CallResult<CallLinkState>>,
    {
        let _guard = self.acquire(room_id).await;

        let record = self.store.get(room_id);
        let observed_counter = record
            .as_ref()
            .map(|r| r.pending_fetch_counter)
            .unwrap_or(0);

        let auth = self.auth.call_link_auth_credential().await?;
        let new_state = operation(record, auth).await?;

        // The record may have been deleted while the operation ran; an
        // update for a gone record is dropped on the floor.
        if self.store.update_state(room_id, new_state.clone()) {
            self.store.clear_pending_fetch(room_id, observed_counter);
        } else {
            tracing::info!(%room_id, "link record gone; fetched state not persisted");
        }

        Ok(new_state)
    }

    /// Fetch the room's current state from the server.
    pub async fn read_call_link(&self, room_id: &RoomId) -> CallResult<CallLinkState> {
        let fetcher = Arc::clone(&self.fetcher);
        let room = room_id.clone();
        self.update_exclusively(room_id, move |_record, auth| async move {
            fetcher.read(&room, &auth).await
        })
        .await
    }

    /// Rename the link. Requires the local user to be an admin.
    pub async fn update_name(&self, room_id: &RoomId, name: String) -> CallResult<CallLinkState> {
        let admin = Arc::clone(&self.admin);
        let room = room_id.clone();
        self.update_exclusively(room_id, move |record, auth| async move {
            let passkey = admin_passkey(record)?;
            admin.update_name(&room, &auth, &passkey, &name).await
        })
        .await
    }

    /// Toggle admin approval for joins. Requires the local user to be an
    /// admin.
    pub async fn update_restrictions(
        &self,
        room_id: &RoomId,
        requires_admin_approval: bool,
    ) -> CallResult<CallLinkState> {
        let admin = Arc::clone(&self.admin);
        let room = room_id.clone();
        self.update_exclusively(room_id, move |record, auth| async move {
            let passkey = admin_passkey(record)?;
            admin
                .update_restrictions(&room, &auth, &passkey, requires_admin_approval)
                .await
        })
        .await
    }

    /// Delete the link on the server and mark the local record deleted.
    /// Serialized with the other operations on the same room.
    pub async fn delete_call_link(&self, room_id: &RoomId) -> CallResult<()> {
        let _guard = self.acquire(room_id).await;

        let record = self
            .store
            .get(room_id)
            .ok_or_else(|| CallError::assertion("deleting an unknown call link"))?;
        let passkey = admin_passkey(Some(record))?;
        let auth = self.auth.call_link_auth_credential().await?;
        self.admin.delete(room_id, &auth, &passkey).await?;
        self.store.mark_deleted(room_id);
        Ok(())
    }

    /// Take the room, waiting FIFO behind any in-flight operation. The
    /// guard owns the room until dropped, so a waiter that is cancelled
    /// while parked (or handed the room and then dropped before running)
    /// releases it like any other holder.
    async fn acquire(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut rooms = match self.room_locks.lock() {
                Ok(rooms) => rooms,
                Err(poisoned) => poisoned.into_inner(),
            };
            rooms.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(rooms.entry(room_id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

fn admin_passkey(record: Option<CallLinkRecord>) -> CallResult<Bytes> {
    record
        .and_then(|r| r.admin_passkey)
        .ok_or_else(|| CallError::assertion("operation requires the link's admin passkey"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::store::InMemoryCallLinkStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    pub(crate) struct FakeFetcher {
        pub reads: AtomicUsize,
        pub fail_first: AtomicUsize,
    }

    impl FakeFetcher {
        pub(crate) fn new() -> Self {
            Self {
                reads: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CallLinkStateFetcher for FakeFetcher {
        async fn read(
            &self,
            room_id: &RoomId,
            _auth: &AuthCredential,
        ) -> CallResult<CallLinkState> {
            let attempt = self.reads.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first.load(Ordering::SeqCst) {
                return Err(CallError::network("fetch failed"));
            }
            Ok(CallLinkState {
                name: Some(format!("room {room_id}")),
                requires_admin_approval: false,
                revoked: false,
                expiration: None,
            })
        }
    }

    pub(crate) struct FakeAdmin;

    #[async_trait]
    impl CallLinkAdminApi for FakeAdmin {
        async fn update_name(
            &self,
            _room_id: &RoomId,
            _auth: &AuthCredential,
            _admin_passkey: &Bytes,
            name: &str,
        ) -> CallResult<CallLinkState> {
            Ok(CallLinkState {
                name: Some(name.to_string()),
                requires_admin_approval: false,
                revoked: false,
                expiration: None,
            })
        }

        async fn update_restrictions(
            &self,
            _room_id: &RoomId,
            _auth: &AuthCredential,
            _admin_passkey: &Bytes,
            requires_admin_approval: bool,
        ) -> CallResult<CallLinkState> {
            Ok(CallLinkState {
                name: None,
                requires_admin_approval,
                revoked: false,
                expiration: None,
            })
        }

        async fn delete(
            &self,
            _room_id: &RoomId,
            _auth: &AuthCredential,
            _admin_passkey: &Bytes,
        ) -> CallResult<()> {
            Ok(())
        }
    }

    pub(crate) struct FakeAuth;

    #[async_trait]
    impl AuthCredentialProvider for FakeAuth {
        async fn call_link_auth_credential(&self) -> CallResult<AuthCredential> {
            Ok(AuthCredential(Bytes::from_static(b"credential")))
        }
    }

    pub(crate) fn updater_with_store(
        store: Arc<dyn CallLinkRecordStore>,
        fetcher: Arc<FakeFetcher>,
    ) -> Arc<CallLinkStateUpdater> {
        Arc::new(CallLinkStateUpdater::new(
            store,
            fetcher,
            Arc::new(FakeAdmin),
            Arc::new(FakeAuth),
        ))
    }

    fn room(name: &str) -> RoomId {
        RoomId(name.to_string())
    }

    #[tokio::test]
    async fn operations_on_one_room_run_fifo() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        let updater = updater_with_store(store, Arc::new(FakeFetcher::new()));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for tag in 0..3u32 {
            let updater = Arc::clone(&updater);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                updater
                    .update_exclusively(&room("a"), move |_record, _auth| async move {
                        order.lock().unwrap().push(("start", tag));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        order.lock().unwrap().push(("end", tag));
                        Ok(CallLinkState::unnamed())
                    })
                    .await
            }));
            // Give each task a chance to reach the queue in order.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(
            *order,
            vec![
                ("start", 0),
                ("end", 0),
                ("start", 1),
                ("end", 1),
                ("start", 2),
                ("end", 2)
            ]
        );
    }

    #[tokio::test]
    async fn second_operation_sees_first_operations_write() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        let updater = updater_with_store(Arc::clone(&store) as _, Arc::new(FakeFetcher::new()));

        let first = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move {
                updater
                    .update_exclusively(&room("a"), |_record, _auth| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(CallLinkState {
                            name: Some("renamed".into()),
                            ..CallLinkState::unnamed()
                        })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;

        let seen = updater
            .update_exclusively(&room("a"), |record, _auth| async move {
                let state = record.and_then(|r| r.state).unwrap_or_else(CallLinkState::unnamed);
                Ok(state)
            })
            .await
            .unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(seen.name.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn rooms_do_not_block_each_other() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("slow"), None));
        store.upsert(CallLinkRecord::new(room("fast"), None));
        let updater = updater_with_store(store, Arc::new(FakeFetcher::new()));

        let (unblock, blocked) = oneshot::channel::<()>();
        let slow = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move {
                updater
                    .update_exclusively(&room("slow"), |_record, _auth| async {
                        let _ = blocked.await;
                        Ok(CallLinkState::unnamed())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;

        // Completes while "slow" is still held.
        updater.read_call_link(&room("fast")).await.unwrap();

        unblock.send(()).unwrap();
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_queued_waiter_does_not_strand_the_room() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        let updater = updater_with_store(store, Arc::new(FakeFetcher::new()));

        let (unblock, blocked) = oneshot::channel::<()>();
        let holder = {
            let updater = Arc::clone(&updater);
            tokio::spawn(async move {
                updater
                    .update_exclusively(&room("a"), |_record, _auth| async {
                        let _ = blocked.await;
                        Ok(CallLinkState::unnamed())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;

        // Park a second operation behind the holder, polled just far
        // enough to join the queue.
        let room_a = room("a");
        let mut parked = Box::pin(updater.read_call_link(&room_a));
        std::future::poll_fn(|cx| {
            assert!(parked.as_mut().poll(cx).is_pending());
            std::task::Poll::Ready(())
        })
        .await;

        // The holder finishes and hands the room toward the parked
        // waiter, which is then dropped without ever being polled again.
        unblock.send(()).unwrap();
        holder.await.unwrap().unwrap();
        drop(parked);

        // The room must still be usable.
        updater.read_call_link(&room("a")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_operation_releases_the_room() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        let updater = updater_with_store(store, Arc::new(FakeFetcher::new()));

        let failed: CallResult<CallLinkState> = updater
            .update_exclusively(&room("a"), |_record, _auth| async {
                Err(CallError::network("server unavailable"))
            })
            .await;
        assert!(failed.is_err());

        // The next operation must not deadlock.
        updater.read_call_link(&room("a")).await.unwrap();
    }

    #[tokio::test]
    async fn state_not_persisted_without_a_record() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        let updater =
            updater_with_store(Arc::clone(&store) as _, Arc::new(FakeFetcher::new()));

        updater.read_call_link(&room("unknown")).await.unwrap();
        assert!(store.get(&room("unknown")).is_none());
    }

    #[tokio::test]
    async fn concurrent_write_keeps_record_pending() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        store.mark_pending_fetch(&room("a"));
        let updater =
            updater_with_store(Arc::clone(&store) as _, Arc::new(FakeFetcher::new()));

        let racing_store = Arc::clone(&store);
        updater
            .update_exclusively(&room("a"), move |_record, _auth| async move {
                // Invalidating write lands mid-operation.
                racing_store.mark_pending_fetch(&room("a"));
                Ok(CallLinkState::unnamed())
            })
            .await
            .unwrap();

        assert!(store.get(&room("a")).unwrap().needs_fetch());
    }

    #[tokio::test]
    async fn admin_operations_require_a_passkey() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(room("a"), None));
        let updater = updater_with_store(store, Arc::new(FakeFetcher::new()));

        let result = updater.update_name(&room("a"), "new name".into()).await;
        assert!(matches!(result, Err(CallError::Assertion { .. })));
    }

    #[tokio::test]
    async fn delete_marks_local_record() {
        let store = Arc::new(InMemoryCallLinkStore::new());
        store.upsert(CallLinkRecord::new(
            room("a"),
            Some(Bytes::from_static(b"passkey")),
        ));
        let updater =
            updater_with_store(Arc::clone(&store) as _, Arc::new(FakeFetcher::new()));

        updater.delete_call_link(&room("a")).await.unwrap();
        assert!(store.get(&room("a")).unwrap().is_deleted);
    }
}
