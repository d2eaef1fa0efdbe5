use crate::config::DrsmConfig;
use crate::drsm::Drsm;
use crate::store::InMemoryStore;
use crate::types::PodId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pool name shared by every scenario.
pub(crate) const POOL: &str = "ngapid";

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub(crate) async fn wait_for<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run `action` until its result satisfies `predicate` or `timeout` elapses.
pub(crate) async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Client configuration with timings scaled down for tests.
pub(crate) fn fast_config() -> DrsmConfig {
    DrsmConfig::new()
        .with_keepalive(Duration::from_millis(50), Duration::from_millis(400))
        .with_scan_interval(Duration::from_millis(5))
        .with_scan_batch_size(256)
        .with_feed_retry_backoff(Duration::from_millis(20))
}

/// Pod identity used by the scenarios.
pub(crate) fn pod(name: &str) -> PodId {
    let index = name.bytes().last().unwrap_or(b'0');
    PodId::new(name, format!("10.0.0.{}", index))
}

/// Start a pod on `store`.
pub(crate) async fn start_pod(store: &Arc<InMemoryStore>, name: &str, config: DrsmConfig) -> Drsm {
    Drsm::init(POOL, pod(name), store.clone(), config)
        .await
        .unwrap()
}

/// Simulate a crash: stop the pod and expire its keepalive record.
pub(crate) async fn crash_pod(store: &Arc<InMemoryStore>, drsm: Drsm) {
    let name = drsm.pod_id().pod_name.clone();
    drsm.shutdown().await;
    drop(drsm);
    store.delete(POOL, &name);
}
