//! Pod crashes, claim races and reclaimed-chunk scans.
//!
//! These tests verify:
//! - A dead pod's chunks end up with exactly one survivor
//! - Reclaimed ids are validated before reuse; ids still in use stay
//!   unavailable until released
//! - Scans can be cancelled and quarantined chunks are never served
//! - Liveness works end to end through TTL expiry
//! - A pod keeps following the pool across change feed failures

#[cfg(test)]
mod tests {
    use crate::drsm::Drsm;
    use crate::scan::ScanPolicy;
    use crate::store::{
        chunk_key, ChunkRecord, Document, InMemoryStore, KeepaliveRecord, ResourceStore,
    };
    use crate::testing::utils::{crash_pod, fast_config, pod, start_pod, wait_for, POOL};
    use crate::types::{ChunkId, ChunkState, ResourceId, CHUNK_SIZE};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio_util::sync::CancellationToken;

    /// Record a chunk and a live keepalive for a pod that is not running.
    async fn seed_peer(store: &InMemoryStore, name: &str, chunk_id: ChunkId) {
        store
            .upsert(
                POOL,
                Document::Keepalive(KeepaliveRecord::new(pod(name), Duration::from_secs(60))),
            )
            .await
            .unwrap();
        store
            .insert_if_absent(
                POOL,
                Document::Chunk(ChunkRecord {
                    chunk_id,
                    owner: pod(name),
                }),
            )
            .await
            .unwrap();
    }

    fn stored_owner(store: &InMemoryStore, chunk_id: ChunkId) -> Option<String> {
        match store.get(POOL, &chunk_key(chunk_id)) {
            Some(Document::Chunk(record)) => Some(record.owner.pod_name),
            _ => None,
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_reclaimed_chunk_keeps_in_use_ids() {
        // Pod A owned chunk 7 and had handed out 7168 (chunk 7, local 0)
        // when it crashed.
        let store = Arc::new(InMemoryStore::new());
        seed_peer(&store, "amf-a", 7).await;

        let in_use = ResourceId::new(7, 0);
        assert_eq!(in_use.as_i32(), 7168);
        let config = fast_config().with_validator(move |id: ResourceId| id == in_use);
        let b = start_pod(&store, "amf-b", config).await;
        assert!(wait_for(|| b.chunk_state(7) == ChunkState::PeerOwned, Duration::from_secs(5)).await);

        store.delete(POOL, "amf-a");
        assert!(wait_for(|| b.chunk_state(7) == ChunkState::Owned, Duration::from_secs(5)).await);
        assert_eq!(stored_owner(&store, 7).as_deref(), Some("amf-b"));
        assert_eq!(b.find_owner(in_use).unwrap(), *b.pod_id());

        let stats = b.stats();
        assert_eq!(stats.free_ids, CHUNK_SIZE - 1);
        assert_eq!(stats.allocated_ids, 1);

        let mut handed_out = HashSet::new();
        for _ in 0..CHUNK_SIZE - 1 {
            let id = b.allocate_id().await.unwrap();
            assert_eq!(id.chunk_id(), 7);
            assert_ne!(id, in_use);
            handed_out.insert(id);
        }
        assert_eq!(handed_out.len(), CHUNK_SIZE - 1);

        // Once the holder gives 7168 back it is served again.
        b.release_id(in_use).unwrap();
        assert_eq!(b.allocate_id().await.unwrap(), in_use);
        assert_eq!(b.stats().owned_chunks, 1);

        b.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_claim_race_has_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let config = fast_config().with_scan_policy(ScanPolicy::TrustImmediately);
        let a = start_pod(&store, "amf-a", config.clone()).await;
        let b = start_pod(&store, "amf-b", config.clone()).await;
        let c = start_pod(&store, "amf-c", config).await;

        let mut chunks = HashSet::new();
        for _ in 0..(2 * CHUNK_SIZE + 5) {
            chunks.insert(a.allocate_id().await.unwrap().chunk_id());
        }
        assert_eq!(chunks.len(), 3);
        assert!(
            wait_for(
                || chunks.iter().all(|id| b.chunk_state(*id) == ChunkState::PeerOwned
                    && c.chunk_state(*id) == ChunkState::PeerOwned),
                Duration::from_secs(5),
            )
            .await
        );

        crash_pod(&store, a).await;

        let settled = || {
            chunks.iter().all(|id| {
                let held_b = b.chunk_state(*id) == ChunkState::Owned;
                let held_c = c.chunk_state(*id) == ChunkState::Owned;
                held_b != held_c
            })
        };
        assert!(wait_for(settled, Duration::from_secs(5)).await);

        for id in &chunks {
            let winner = if b.chunk_state(*id) == ChunkState::Owned { &b } else { &c };
            let loser = if std::ptr::eq(winner, &b) { &c } else { &b };
            assert_eq!(stored_owner(&store, *id).as_deref(), Some(winner.pod_id().pod_name.as_str()));
            assert!(
                wait_for(
                    || loser.chunk_state(*id) == ChunkState::PeerOwned,
                    Duration::from_secs(5),
                )
                .await
            );
        }

        b.shutdown().await;
        c.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_scan_validates_each_id_once() {
        let store = Arc::new(InMemoryStore::new());
        seed_peer(&store, "amf-a", 3).await;

        let calls: Arc<Mutex<HashMap<ResourceId, usize>>> = Arc::default();
        let recorder = calls.clone();
        let config = fast_config()
            .with_scan_batch_size(16)
            .with_validator(move |id: ResourceId| {
                *recorder.lock().entry(id).or_default() += 1;
                id.local_id() % 100 == 0
            });
        let b = start_pod(&store, "amf-b", config).await;
        assert!(wait_for(|| b.stats().known_chunks == 1, Duration::from_secs(5)).await);

        store.delete(POOL, "amf-a");
        assert!(wait_for(|| b.chunk_state(3) == ChunkState::Owned, Duration::from_secs(10)).await);

        let calls = calls.lock();
        assert_eq!(calls.len(), CHUNK_SIZE);
        assert!(calls.values().all(|n| *n == 1));
        assert!(calls.keys().all(|id| id.chunk_id() == 3));

        // Locals 0, 100, ..., 1000 stay allocated.
        assert_eq!(b.stats().allocated_ids, 11);
        drop(calls);

        b.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_cancelled_scan_leaves_chunk_unusable() {
        let store = Arc::new(InMemoryStore::new());
        seed_peer(&store, "amf-a", 5).await;

        let config = fast_config()
            .with_scan_interval(Duration::from_secs(3600))
            .with_scan_batch_size(1)
            .with_validator(|_id: ResourceId| false);
        let b = start_pod(&store, "amf-b", config).await;
        assert!(wait_for(|| b.stats().known_chunks == 1, Duration::from_secs(5)).await);

        store.delete(POOL, "amf-a");
        assert!(wait_for(|| b.chunk_state(5) == ChunkState::Scanning, Duration::from_secs(5)).await);
        assert!(wait_for(|| b.cancel_scan(5), Duration::from_secs(5)).await);
        assert!(!b.cancel_scan(5));

        // Releases still resolve against the scanning chunk.
        b.release_id(ResourceId::new(5, 700)).unwrap();

        let id = b.allocate_id().await.unwrap();
        assert_ne!(id.chunk_id(), 5);
        assert_eq!(b.chunk_state(5), ChunkState::Scanning);

        b.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_quarantined_chunk_is_never_served() {
        let store = Arc::new(InMemoryStore::new());
        seed_peer(&store, "amf-a", 9).await;

        let b = start_pod(&store, "amf-b", fast_config()).await;
        assert!(wait_for(|| b.stats().known_chunks == 1, Duration::from_secs(5)).await);

        store.delete(POOL, "amf-a");
        assert!(wait_for(|| b.chunk_state(9) == ChunkState::Scanning, Duration::from_secs(5)).await);
        assert_eq!(stored_owner(&store, 9).as_deref(), Some("amf-b"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.chunk_state(9), ChunkState::Scanning);
        let id = b.allocate_id().await.unwrap();
        assert_ne!(id.chunk_id(), 9);

        b.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_ttl_expiry_triggers_claim() {
        let store = Arc::new(InMemoryStore::new());
        let reaper_stop = CancellationToken::new();
        let reaper = store.spawn_ttl_reaper(Duration::from_millis(20), reaper_stop.clone());

        let config = fast_config().with_scan_policy(ScanPolicy::TrustImmediately);
        let a = start_pod(&store, "amf-a", config.clone()).await;
        let b = start_pod(&store, "amf-b", config).await;

        let id = a.allocate_id().await.unwrap();
        let chunk_id = id.chunk_id();
        assert!(wait_for(|| b.chunk_state(chunk_id) == ChunkState::PeerOwned, Duration::from_secs(5)).await);

        // Live pods outlast several TTL periods.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(b.chunk_state(chunk_id), ChunkState::PeerOwned);
        assert!(store.get(POOL, "amf-b").is_some());

        // Stop A without deleting anything; the TTL index does the rest.
        a.shutdown().await;
        drop(a);
        assert!(wait_for(|| b.chunk_state(chunk_id) == ChunkState::Owned, Duration::from_secs(5)).await);
        assert_eq!(b.find_owner(id).unwrap(), *b.pod_id());

        b.shutdown().await;
        reaper_stop.cancel();
        reaper.await.unwrap();
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_feed_failures_are_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_watches(3);
        seed_peer(&store, "amf-a", 11).await;

        let b = start_pod(&store, "amf-b", fast_config()).await;
        assert!(wait_for(|| b.chunk_state(11) == ChunkState::PeerOwned, Duration::from_secs(5)).await);

        // A terminated feed is reopened without another resync.
        let queries = store.op_counts().queries;
        store.close_feeds(POOL);
        assert!(wait_for(|| store.op_counts().watches >= 5, Duration::from_secs(5)).await);
        seed_peer(&store, "amf-c", 12).await;
        assert!(wait_for(|| b.chunk_state(12) == ChunkState::PeerOwned, Duration::from_secs(5)).await);
        assert_eq!(store.op_counts().queries, queries);

        b.shutdown().await;
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_taken_over_chunk_is_evicted() {
        let store = Arc::new(InMemoryStore::new());
        let a: Drsm = start_pod(&store, "amf-a", fast_config()).await;
        let id = a.allocate_id().await.unwrap();

        // Another pod wrongly concluded A was dead and took the chunk.
        let taken = store
            .compare_and_update(
                POOL,
                &crate::store::ChunkFilter {
                    chunk_id: id.chunk_id(),
                    owner_name: "amf-a".into(),
                },
                &crate::store::ChunkUpdate { owner: pod("amf-x") },
            )
            .await
            .unwrap();
        assert!(taken);

        assert!(wait_for(|| a.chunk_state(id.chunk_id()) != ChunkState::Owned, Duration::from_secs(5)).await);
        assert!(a.release_id(id).is_err());
        let next = a.allocate_id().await.unwrap();
        assert_ne!(next.chunk_id(), id.chunk_id());

        a.shutdown().await;
    }
}
