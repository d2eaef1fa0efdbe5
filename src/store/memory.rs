//! In-memory [`ResourceStore`] for tests and single-host deployments.

use super::{
    unix_millis, ChangeEvent, ChangeStream, ChunkFilter, ChunkRecord, ChunkUpdate, Document,
    DocumentKind, ResourceStore, StoreResult, UpdatedFields, EXPIRE_AT_FIELD,
};
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counts of mutating and subscribing calls, for asserting what an instance
/// did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOpCounts {
    pub inserts: u64,
    pub compare_and_updates: u64,
    pub upserts: u64,
    pub ttl_indexes: u64,
    pub watches: u64,
    pub queries: u64,
}

#[derive(Debug, Default)]
struct Collection {
    docs: BTreeMap<String, Document>,
    /// TTL-indexed field -> grace period past the stored timestamp.
    ttl_indexes: HashMap<String, Duration>,
    watchers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

impl Collection {
    /// Deliver an event to every live subscriber, dropping closed ones.
    fn publish(&mut self, event: ChangeEvent) {
        self.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug, Default)]
struct Counters {
    inserts: AtomicU64,
    compare_and_updates: AtomicU64,
    upserts: AtomicU64,
    ttl_indexes: AtomicU64,
    watches: AtomicU64,
    queries: AtomicU64,
}

/// A store kept entirely in process memory.
///
/// Every operation runs under one lock, so insert-if-absent and
/// compare-and-update are atomic and change events are emitted in commit
/// order. TTL expiry only happens when [`expire_due`](Self::expire_due) runs,
/// either directly or from [`spawn_ttl_reaper`](Self::spawn_ttl_reaper).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
    counters: Counters,
    unavailable: AtomicBool,
    failing_watches: AtomicUsize,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the operation counters.
    pub fn op_counts(&self) -> StoreOpCounts {
        let c = &self.counters;
        StoreOpCounts {
            inserts: c.inserts.load(Ordering::Relaxed),
            compare_and_updates: c.compare_and_updates.load(Ordering::Relaxed),
            upserts: c.upserts.load(Ordering::Relaxed),
            ttl_indexes: c.ttl_indexes.load(Ordering::Relaxed),
            watches: c.watches.load(Ordering::Relaxed),
            queries: c.queries.load(Ordering::Relaxed),
        }
    }

    /// Make every subsequent call fail with a connection error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `count` calls to `watch`.
    pub fn fail_next_watches(&self, count: usize) {
        self.failing_watches.store(count, Ordering::SeqCst);
    }

    /// Terminate every open change feed of `collection`.
    pub fn close_feeds(&self, collection: &str) {
        if let Some(coll) = self.collections.lock().get_mut(collection) {
            coll.watchers.clear();
        }
    }

    /// Fetch a document by key.
    pub fn get(&self, collection: &str, key: &str) -> Option<Document> {
        self.collections
            .lock()
            .get(collection)
            .and_then(|c| c.docs.get(key).cloned())
    }

    /// Remove a document, emitting a delete event if it existed.
    pub fn delete(&self, collection: &str, key: &str) -> bool {
        let mut collections = self.collections.lock();
        let Some(coll) = collections.get_mut(collection) else {
            return false;
        };
        if coll.docs.remove(key).is_none() {
            return false;
        }
        coll.publish(ChangeEvent::Delete {
            key: key.to_string(),
        });
        true
    }

    /// Number of documents in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, |c| c.docs.len())
    }

    /// Whether `collection` holds no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Delete every TTL-indexed document whose expiry has passed.
    /// Returns the number of documents removed.
    pub fn expire_due(&self) -> usize {
        self.expire_at(SystemTime::now())
    }

    /// Delete every TTL-indexed document that has expired as of `now`.
    pub fn expire_at(&self, now: SystemTime) -> usize {
        let now_ms = unix_millis(now);
        let mut removed = 0;
        let mut collections = self.collections.lock();

        for coll in collections.values_mut() {
            let Some(grace) = coll.ttl_indexes.get(EXPIRE_AT_FIELD).copied() else {
                continue;
            };
            let expired: Vec<String> = coll
                .docs
                .iter()
                .filter_map(|(key, doc)| match doc {
                    Document::Keepalive(k)
                        if k.expire_at_ms + grace.as_millis() as u64 <= now_ms =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();

            for key in expired {
                coll.docs.remove(&key);
                debug!(key = %key, "Document expired");
                coll.publish(ChangeEvent::Delete { key });
                removed += 1;
            }
        }
        removed
    }

    /// Run [`expire_due`](Self::expire_due) every `period` until cancelled.
    pub fn spawn_ttl_reaper(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.expire_due();
                    }
                }
            }
        })
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Connection("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn insert_if_absent(&self, collection: &str, document: Document) -> StoreResult<bool> {
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        let key = document.key();
        if coll.docs.contains_key(&key) {
            return Ok(false);
        }
        coll.docs.insert(key.clone(), document.clone());
        coll.publish(ChangeEvent::Insert { key, document });
        Ok(true)
    }

    async fn compare_and_update(
        &self,
        collection: &str,
        filter: &ChunkFilter,
        update: &ChunkUpdate,
    ) -> StoreResult<bool> {
        self.counters.compare_and_updates.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut collections = self.collections.lock();
        let Some(coll) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let key = super::chunk_key(filter.chunk_id);
        match coll.docs.get_mut(&key) {
            Some(Document::Chunk(record)) if record.owner.pod_name == filter.owner_name => {
                *record = ChunkRecord {
                    chunk_id: filter.chunk_id,
                    owner: update.owner.clone(),
                };
                coll.publish(ChangeEvent::Update {
                    key,
                    fields: UpdatedFields {
                        owner: Some(update.owner.clone()),
                        expire_at_ms: None,
                    },
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn upsert(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.counters.upserts.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        let key = document.key();
        let fields = match &document {
            Document::Keepalive(k) => UpdatedFields {
                owner: None,
                expire_at_ms: Some(k.expire_at_ms),
            },
            Document::Chunk(c) => UpdatedFields {
                owner: Some(c.owner.clone()),
                expire_at_ms: None,
            },
        };
        let event = if coll.docs.insert(key.clone(), document.clone()).is_some() {
            ChangeEvent::Update { key, fields }
        } else {
            ChangeEvent::Insert { key, document }
        };
        coll.publish(event);
        Ok(())
    }

    async fn create_ttl_index(
        &self,
        collection: &str,
        field: &str,
        expire_after: Duration,
    ) -> StoreResult<bool> {
        self.counters.ttl_indexes.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let mut collections = self.collections.lock();
        let coll = collections.entry(collection.to_string()).or_default();
        if coll.ttl_indexes.contains_key(field) {
            return Ok(false);
        }
        coll.ttl_indexes.insert(field.to_string(), expire_after);
        Ok(true)
    }

    async fn watch(&self, collection: &str) -> StoreResult<ChangeStream> {
        self.counters.watches.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        let failed = self
            .failing_watches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::FeedUnavailable("injected watch failure".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .watchers
            .push(tx);
        Ok(rx)
    }

    async fn find_many(&self, collection: &str, kind: DocumentKind) -> StoreResult<Vec<Document>> {
        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;

        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|d| d.kind() == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{chunk_key, KeepaliveRecord};
    use crate::types::PodId;

    const POOL: &str = "ngapid";

    fn chunk_doc(chunk_id: u32, owner: &str) -> Document {
        Document::Chunk(ChunkRecord {
            chunk_id,
            owner: PodId::new(owner, "10.0.0.1"),
        })
    }

    #[tokio::test]
    async fn test_insert_if_absent_only_once() {
        let store = InMemoryStore::new();
        assert!(store.insert_if_absent(POOL, chunk_doc(7, "a")).await.unwrap());
        assert!(!store.insert_if_absent(POOL, chunk_doc(7, "b")).await.unwrap());

        match store.get(POOL, &chunk_key(7)) {
            Some(Document::Chunk(c)) => assert_eq!(c.owner.pod_name, "a"),
            other => panic!("unexpected document: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_compare_and_update_single_winner() {
        let store = InMemoryStore::new();
        store.insert_if_absent(POOL, chunk_doc(7, "a")).await.unwrap();

        let filter = ChunkFilter {
            chunk_id: 7,
            owner_name: "a".into(),
        };
        let to_b = ChunkUpdate {
            owner: PodId::new("b", ""),
        };
        let to_c = ChunkUpdate {
            owner: PodId::new("c", ""),
        };
        assert!(store.compare_and_update(POOL, &filter, &to_b).await.unwrap());
        assert!(!store.compare_and_update(POOL, &filter, &to_c).await.unwrap());

        match store.get(POOL, &chunk_key(7)) {
            Some(Document::Chunk(c)) => assert_eq!(c.owner.pod_name, "b"),
            other => panic!("unexpected document: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_reports_changes_in_order() {
        let store = InMemoryStore::new();
        let mut feed = store.watch(POOL).await.unwrap();

        let pod = PodId::new("a", "10.0.0.1");
        store
            .upsert(POOL, Document::Keepalive(KeepaliveRecord::new(pod.clone(), Duration::from_secs(20))))
            .await
            .unwrap();
        store
            .upsert(POOL, Document::Keepalive(KeepaliveRecord::new(pod, Duration::from_secs(20))))
            .await
            .unwrap();
        store.delete(POOL, "a");

        assert!(matches!(feed.recv().await, Some(ChangeEvent::Insert { .. })));
        match feed.recv().await {
            Some(ChangeEvent::Update { key, fields }) => {
                assert_eq!(key, "a");
                assert!(fields.expire_at_ms.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(
            feed.recv().await,
            Some(ChangeEvent::Delete { key: "a".into() })
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry_emits_delete() {
        let store = InMemoryStore::new();
        store
            .create_ttl_index(POOL, EXPIRE_AT_FIELD, Duration::ZERO)
            .await
            .unwrap();
        let mut feed = store.watch(POOL).await.unwrap();

        let record = KeepaliveRecord::new(PodId::new("a", ""), Duration::from_secs(60));
        store.upsert(POOL, Document::Keepalive(record)).await.unwrap();
        store.insert_if_absent(POOL, chunk_doc(1, "a")).await.unwrap();

        assert_eq!(store.expire_due(), 0);
        let later = SystemTime::now() + Duration::from_secs(120);
        assert_eq!(store.expire_at(later), 1);
        assert_eq!(store.len(POOL), 1);

        let mut saw_delete = false;
        while let Ok(event) = feed.try_recv() {
            if event == (ChangeEvent::Delete { key: "a".into() }) {
                saw_delete = true;
            }
        }
        assert!(saw_delete);
    }

    #[tokio::test]
    async fn test_unavailable_and_failing_watch() {
        let store = InMemoryStore::new();
        store.fail_next_watches(1);
        assert!(store.watch(POOL).await.is_err());
        assert!(store.watch(POOL).await.is_ok());

        store.set_unavailable(true);
        assert!(store.insert_if_absent(POOL, chunk_doc(1, "a")).await.is_err());
        assert!(store.find_many(POOL, DocumentKind::Chunk).await.is_err());
        store.set_unavailable(false);
        assert!(store.find_many(POOL, DocumentKind::Chunk).await.unwrap().is_empty());

        let counts = store.op_counts();
        assert_eq!(counts.watches, 2);
        assert_eq!(counts.inserts, 1);
        assert_eq!(counts.queries, 2);
    }
}
