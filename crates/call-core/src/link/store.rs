//! Call link records
//!
//! A record is the locally persisted knowledge about one call link: its
//! cached server metadata, our admin passkey if we created it, a deletion
//! flag, and the pending-fetch counter that drives the background refresh
//! loop. The counter increments on every invalidating write; a completed
//! fetch only clears the needs-fetch flag if the counter still holds the
//! value observed when the fetch started, so a write that raced the fetch
//! forces another one.

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::RoomId;

/// Server-side metadata of a call link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallLinkState {
    pub name: Option<String>,
    pub requires_admin_approval: bool,
    pub revoked: bool,
    pub expiration: Option<DateTime<Utc>>,
}

impl CallLinkState {
    pub fn unnamed() -> Self {
        Self {
            name: None,
            requires_admin_approval: false,
            revoked: false,
            expiration: None,
        }
    }
}

/// Locally persisted knowledge about one call link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLinkRecord {
    pub room_id: RoomId,
    /// Present when the local user is an admin of the link
    pub admin_passkey: Option<Bytes>,
    /// Cached server metadata; `None` until the first successful fetch
    pub state: Option<CallLinkState>,
    /// Incremented by every write that invalidates the cached state
    pub pending_fetch_counter: u64,
    /// Counter value as of the last fetch that was allowed to clear
    pub fetched_counter: u64,
    pub is_deleted: bool,
}

impl CallLinkRecord {
    pub fn new(room_id: RoomId, admin_passkey: Option<Bytes>) -> Self {
        Self {
            room_id,
            admin_passkey,
            state: None,
            pending_fetch_counter: 0,
            fetched_counter: 0,
            is_deleted: false,
        }
    }

    /// Whether the cached state is stale and a fetch is owed.
    pub fn needs_fetch(&self) -> bool {
        !self.is_deleted && self.pending_fetch_counter > self.fetched_counter
    }
}

/// Persistence boundary for call link records.
///
/// Implementations must apply each method atomically with respect to the
/// others; the serializer and fetch loop rely on the counter updates being
/// indivisible.
pub trait CallLinkRecordStore: Send + Sync {
    fn get(&self, room_id: &RoomId) -> Option<CallLinkRecord>;

    /// Insert a record, replacing any existing one for the room.
    fn upsert(&self, record: CallLinkRecord);

    /// Replace the cached state of an existing record. Returns `false`
    /// when no record exists, in which case nothing is persisted.
    fn update_state(&self, room_id: &RoomId, state: CallLinkState) -> bool;

    /// Flag the room as needing a fetch, bumping its counter. Creates the
    /// record if the room is unknown.
    fn mark_pending_fetch(&self, room_id: &RoomId);

    /// Conclude a fetch that observed `observed_counter` when it started.
    /// Clears the needs-fetch flag only if no write bumped the counter in
    /// the meantime. Returns whether the flag was cleared.
    fn clear_pending_fetch(&self, room_id: &RoomId, observed_counter: u64) -> bool;

    /// Oldest record still owing a fetch, if any.
    fn next_pending_fetch(&self) -> Option<CallLinkRecord>;

    /// Mark the link deleted. Deleted links are skipped by the fetch loop.
    fn mark_deleted(&self, room_id: &RoomId) -> bool;
}

#[derive(Default)]
struct StoreInner {
    records: IndexMap<RoomId, CallLinkRecord>,
    /// Rooms owing a fetch, oldest first. Entries may go stale when a
    /// fetch clears them; `next_pending_fetch` prunes as it scans.
    fetch_queue: VecDeque<RoomId>,
}

/// In-memory store, suitable for tests and for hosts that persist link
/// records elsewhere.
#[derive(Default)]
pub struct InMemoryCallLinkStore {
    inner: Mutex<StoreInner>,
}

impl InMemoryCallLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CallLinkRecordStore for InMemoryCallLinkStore {
    fn get(&self, room_id: &RoomId) -> Option<CallLinkRecord> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(room_id).cloned())
    }

    fn upsert(&self, record: CallLinkRecord) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.records.insert(record.room_id.clone(), record);
        }
    }

    fn update_state(&self, room_id: &RoomId, state: CallLinkState) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.records.get_mut(room_id) {
            Some(record) => {
                record.state = Some(state);
                true
            }
            None => false,
        }
    }

    fn mark_pending_fetch(&self, room_id: &RoomId) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let record = inner
            .records
            .entry(room_id.clone())
            .or_insert_with(|| CallLinkRecord::new(room_id.clone(), None));
        record.pending_fetch_counter += 1;
        if !inner.fetch_queue.contains(room_id) {
            inner.fetch_queue.push_back(room_id.clone());
        }
    }

    fn clear_pending_fetch(&self, room_id: &RoomId, observed_counter: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(record) = inner.records.get_mut(room_id) else {
            return false;
        };
        if record.pending_fetch_counter != observed_counter {
            tracing::debug!(
                %room_id,
                observed = observed_counter,
                current = record.pending_fetch_counter,
                "link record changed during fetch; keeping it pending"
            );
            return false;
        }
        record.fetched_counter = observed_counter;
        inner.fetch_queue.retain(|queued| queued != room_id);
        true
    }

    fn next_pending_fetch(&self) -> Option<CallLinkRecord> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        while let Some(room_id) = inner.fetch_queue.front().cloned() {
            match inner.records.get(&room_id) {
                Some(record) if record.needs_fetch() => return Some(record.clone()),
                _ => {
                    inner.fetch_queue.pop_front();
                }
            }
        }
        None
    }

    fn mark_deleted(&self, room_id: &RoomId) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        inner.fetch_queue.retain(|queued| queued != room_id);
        match inner.records.get_mut(room_id) {
            Some(record) => {
                record.is_deleted = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(name: &str) -> RoomId {
        RoomId(name.to_string())
    }

    #[test]
    fn pending_fetch_cleared_only_when_counter_unchanged() {
        let store = InMemoryCallLinkStore::new();
        store.mark_pending_fetch(&room("a"));
        let observed = store.get(&room("a")).unwrap().pending_fetch_counter;

        // A write lands while the fetch is in flight.
        store.mark_pending_fetch(&room("a"));
        assert!(!store.clear_pending_fetch(&room("a"), observed));
        assert!(store.get(&room("a")).unwrap().needs_fetch());

        let observed = store.get(&room("a")).unwrap().pending_fetch_counter;
        assert!(store.clear_pending_fetch(&room("a"), observed));
        assert!(!store.get(&room("a")).unwrap().needs_fetch());
    }

    #[test]
    fn fetch_queue_is_oldest_first() {
        let store = InMemoryCallLinkStore::new();
        store.mark_pending_fetch(&room("first"));
        store.mark_pending_fetch(&room("second"));
        // Re-flagging an already queued room does not move it back.
        store.mark_pending_fetch(&room("first"));

        assert_eq!(store.next_pending_fetch().unwrap().room_id, room("first"));
        let observed = store.get(&room("first")).unwrap().pending_fetch_counter;
        store.clear_pending_fetch(&room("first"), observed);
        assert_eq!(store.next_pending_fetch().unwrap().room_id, room("second"));
    }

    #[test]
    fn deleted_links_are_skipped() {
        let store = InMemoryCallLinkStore::new();
        store.mark_pending_fetch(&room("gone"));
        store.mark_deleted(&room("gone"));
        assert!(store.next_pending_fetch().is_none());
    }

    #[test]
    fn link_state_survives_json_persistence() {
        // Hosts that persist records serialize the cached state as JSON.
        let state = CallLinkState {
            name: Some("team standup".into()),
            requires_admin_approval: true,
            revoked: false,
            expiration: Some(chrono::Utc::now()),
        };
        let json = serde_json::to_string(&state).unwrap();
        let restored: CallLinkState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn update_state_requires_existing_record() {
        let store = InMemoryCallLinkStore::new();
        assert!(!store.update_state(&room("missing"), CallLinkState::unnamed()));

        store.upsert(CallLinkRecord::new(room("present"), None));
        assert!(store.update_state(&room("present"), CallLinkState::unnamed()));
        assert!(store.get(&room("present")).unwrap().state.is_some());
    }
}
