//! Two pods sharing an id pool, one of which crashes.

use drsm::{ChunkState, Drsm, DrsmConfig, InMemoryStore, PodId, ResourceId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("drsm=debug,info")
        .init();

    let store = Arc::new(InMemoryStore::new());
    let reaper_stop = CancellationToken::new();
    let reaper = store.spawn_ttl_reaper(Duration::from_millis(100), reaper_stop.clone());

    let config = DrsmConfig::new()
        .with_keepalive(Duration::from_millis(500), Duration::from_secs(2))
        .with_scan_interval(Duration::from_millis(10))
        .with_scan_batch_size(128)
        .with_ip_pool("ue", "10.60.0.0/24");

    let pod_a = Drsm::init("ngapid", PodId::new("amf-a", "10.0.0.1"), store.clone(), config.clone()).await?;

    // Ids A handed out; B asks this set during its scan.
    let held: Arc<parking_lot::Mutex<HashSet<ResourceId>>> = Arc::default();
    let lookup = held.clone();
    let pod_b = Drsm::init(
        "ngapid",
        PodId::new("amf-b", "10.0.0.2"),
        store.clone(),
        config.with_validator(move |id: ResourceId| lookup.lock().contains(&id)),
    )
    .await?;

    println!("--- Allocation ---");
    for _ in 0..3 {
        let id = pod_a.allocate_id().await?;
        held.lock().insert(id);
        println!("amf-a allocated {}", id);
    }
    let id = pod_b.allocate_id().await?;
    println!("amf-b allocated {}", id);

    let ip = pod_a.acquire_ip("ue").await?;
    println!("amf-a acquired {}", ip);
    pod_a.release_ip("ue", &ip).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let a_chunk = held.lock().iter().next().map(|id| id.chunk_id()).unwrap_or_default();
    println!("chunk {} seen by amf-b as {}", a_chunk, pod_b.chunk_state(a_chunk));

    println!("\n--- amf-a crashes ---");
    pod_a.shutdown().await;
    drop(pod_a);

    for _ in 0..50 {
        if pod_b.chunk_state(a_chunk) == ChunkState::Owned {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    println!("chunk {} seen by amf-b as {}", a_chunk, pod_b.chunk_state(a_chunk));

    let stats = pod_b.stats();
    println!("\namf-b stats:");
    println!("  Owned chunks: {}", stats.owned_chunks);
    println!("  Scanning chunks: {}", stats.scanning_chunks);
    println!("  Free ids: {}", stats.free_ids);
    println!("  Allocated ids: {}", stats.allocated_ids);
    println!("  Known chunks: {}", stats.known_chunks);
    println!("  Known pods: {}", stats.known_pods);

    println!("\nShutting down...");
    pod_b.shutdown().await;
    reaper_stop.cancel();
    reaper.await?;

    Ok(())
}
