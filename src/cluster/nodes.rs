//! Periodically refreshed snapshot of per-node CPU/RAM pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{ClusterView, NodeMetric};

/// Host → utilization map, swapped wholesale on each successful refresh.
///
/// Readers always get an independent copy, so no lock is held across
/// selection. Before the first successful refresh the snapshot is empty and
/// callers must treat missing hosts as "no pressure signal".
pub struct NodeStatusCache {
    snapshot: RwLock<HashMap<String, NodeMetric>>,
    ready: AtomicBool,
}

impl NodeStatusCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    /// Copy of the latest snapshot.
    pub fn get(&self) -> HashMap<String, NodeMetric> {
        self.snapshot.read().expect("node snapshot lock").clone()
    }

    /// Whether at least one refresh has succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Pulls fresh metrics; a failure keeps the previous snapshot intact.
    pub async fn refresh(&self, cluster: &dyn ClusterView) {
        match cluster.list_node_metrics().await {
            Ok(metrics) => {
                tracing::debug!(nodes = metrics.len(), "refreshed node status");
                *self.snapshot.write().expect("node snapshot lock") = metrics;
                self.ready.store(true, Ordering::Release);
            }
            Err(error) => {
                tracing::warn!(%error, "node metrics refresh failed, keeping previous snapshot");
            }
        }
    }

    /// Spawns the background refresher; the first refresh runs immediately.
    pub fn spawn_refresher(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterView>,
        every: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.refresh(cluster.as_ref()).await;
            }
        })
    }
}

impl Default for NodeStatusCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testutil::FakeCluster;

    fn metric(cpu: f64, ram: f64) -> NodeMetric {
        NodeMetric {
            cpu_usage: cpu,
            ram_usage: ram,
        }
    }

    #[tokio::test]
    async fn test_empty_before_first_refresh() {
        let cache = NodeStatusCache::new();
        assert!(cache.get().is_empty());
        assert!(!cache.is_ready());
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let cluster = FakeCluster::with_pods(Vec::new());
        cluster.set_metrics(HashMap::from([("10.0.0.1".to_string(), metric(0.5, 0.4))]));

        let cache = NodeStatusCache::new();
        cache.refresh(&cluster).await;

        assert!(cache.is_ready());
        let snapshot = cache.get();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["10.0.0.1"], metric(0.5, 0.4));

        cluster.set_metrics(HashMap::from([("10.0.0.2".to_string(), metric(0.9, 0.1))]));
        cache.refresh(&cluster).await;

        let snapshot = cache.get();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let cluster = FakeCluster::with_pods(Vec::new());
        cluster.set_metrics(HashMap::from([("10.0.0.1".to_string(), metric(0.2, 0.3))]));

        let cache = NodeStatusCache::new();
        cache.refresh(&cluster).await;
        assert_eq!(cache.get().len(), 1);

        cluster.fail_metrics();
        cache.refresh(&cluster).await;

        assert_eq!(cache.get().len(), 1);
        assert!(cache.is_ready());
    }

    #[tokio::test]
    async fn test_failed_refresh_before_success_stays_empty() {
        let cluster = FakeCluster::unavailable();
        let cache = NodeStatusCache::new();
        cache.refresh(&cluster).await;

        assert!(cache.get().is_empty());
        assert!(!cache.is_ready());
    }

    #[tokio::test]
    async fn test_get_returns_independent_copy() {
        let cluster = FakeCluster::with_pods(Vec::new());
        cluster.set_metrics(HashMap::from([("10.0.0.1".to_string(), metric(0.2, 0.3))]));

        let cache = NodeStatusCache::new();
        cache.refresh(&cluster).await;

        let mut copy = cache.get();
        copy.clear();
        assert_eq!(cache.get().len(), 1);
    }
}
