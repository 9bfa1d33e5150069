//! Per-service cache of pods and routing metadata, kept current by
//! informer-style watches and evicted after an idle TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ClusterView, PodEvent, PodEventHandler, PodRef, Unavailable, WatchHandle};

const JANITOR_PERIOD: Duration = Duration::from_secs(60);

/// Lazily populated service cache.
///
/// The first lookup for a service lists its pods and installs a watch; the
/// watch handler is the sole writer of the entry's pod list from then on.
/// Entries not requested for longer than `cache_hold_time` are evicted by the
/// janitor, which also stops their watches.
pub struct ServiceRegistry {
    cluster: Arc<dyn ClusterView>,
    entries: DashMap<String, Arc<ServiceEntry>>,
    init_lock: tokio::sync::Mutex<()>,
    cache_hold_time: Duration,
}

struct ServiceEntry {
    pods: RwLock<Vec<PodRef>>,
    annotations: HashMap<String, String>,
    target_port: String,
    last_request: Mutex<Instant>,
    watch: Mutex<Option<WatchHandle>>,
}

/// Point-in-time copy of a service entry handed to the selector.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub pods: Vec<PodRef>,
    pub annotations: HashMap<String, String>,
    pub target_port: String,
}

impl ServiceRegistry {
    pub fn new(cluster: Arc<dyn ClusterView>, cache_hold_time: Duration) -> Self {
        Self {
            cluster,
            entries: DashMap::new(),
            init_lock: tokio::sync::Mutex::new(()),
            cache_hold_time,
        }
    }

    /// Returns the cached entry for `service`, listing pods and installing a
    /// watch on first use. Every call refreshes the entry's idle timestamp.
    pub async fn get_or_init(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceSnapshot, Unavailable> {
        if let Some(entry) = self.entries.get(service) {
            entry.touch();
            return Ok(entry.snapshot());
        }

        // One initializer at a time, so an entry never ends up with two
        // watches. Losers of the race find the entry on re-check.
        let _guard = self.init_lock.lock().await;
        if let Some(entry) = self.entries.get(service) {
            entry.touch();
            return Ok(entry.snapshot());
        }

        let listed = self
            .cluster
            .list_pods_for_service(namespace, service)
            .await?;
        tracing::info!(
            service,
            pods = listed.pods.len(),
            "populated service entry from listing"
        );

        let entry = Arc::new(ServiceEntry {
            pods: RwLock::new(listed.pods),
            annotations: listed.annotations,
            target_port: listed.target_port,
            last_request: Mutex::new(Instant::now()),
            watch: Mutex::new(None),
        });
        self.entries.insert(service.to_string(), entry.clone());

        // The watch is installed only after the initial list is stored; the
        // handler writes through a weak reference so an evicted entry is not
        // kept alive by its own watch.
        let handler: PodEventHandler = {
            let entry = Arc::downgrade(&entry);
            let service = service.to_string();
            Arc::new(move |event| match entry.upgrade() {
                Some(entry) => {
                    let mut pods = entry.pods.write().expect("pod list lock");
                    apply_event(&mut pods, event);
                }
                None => tracing::debug!(service = %service, "watch event for evicted service"),
            })
        };
        match self
            .cluster
            .watch_pods(namespace, &listed.selector, handler)
            .await
        {
            Ok(handle) => {
                *entry.watch.lock().expect("watch slot lock") = Some(handle);
            }
            Err(error) => {
                // An entry without a watch would serve stale membership
                // forever; drop it and let the next request retry.
                self.entries.remove(service);
                return Err(error);
            }
        }

        Ok(entry.snapshot())
    }

    /// Spawns the janitor that sweeps idle entries once a minute.
    pub fn spawn_janitor(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.evict_idle();
            }
        })
    }

    fn evict_idle(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_request_at()) > self.cache_hold_time)
            .map(|entry| entry.key().clone())
            .collect();

        for service in expired {
            if let Some((_, entry)) = self.entries.remove(&service) {
                if let Some(handle) = entry.watch.lock().expect("watch slot lock").take() {
                    handle.stop();
                }
                tracing::info!(service, "evicted idle service entry");
            }
        }
    }
}

impl ServiceEntry {
    fn touch(&self) {
        *self.last_request.lock().expect("last request lock") = Instant::now();
    }

    fn last_request_at(&self) -> Instant {
        *self.last_request.lock().expect("last request lock")
    }

    fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            pods: self.pods.read().expect("pod list lock").clone(),
            annotations: self.annotations.clone(),
            target_port: self.target_port.clone(),
        }
    }
}

/// Applies one membership event to a pod list: adds deduplicate by name,
/// updates replace by name, deletes remove by name.
fn apply_event(pods: &mut Vec<PodRef>, event: PodEvent) {
    match event {
        PodEvent::Added(pod) => {
            if !pods.iter().any(|p| p.name == pod.name) {
                pods.push(pod);
            }
        }
        PodEvent::Updated(pod) => {
            if let Some(existing) = pods.iter_mut().find(|p| p.name == pod.name) {
                *existing = pod;
            }
        }
        PodEvent::Deleted(pod) => {
            pods.retain(|p| p.name != pod.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cluster::testutil::{pod, FakeCluster};

    fn registry(cluster: Arc<FakeCluster>) -> ServiceRegistry {
        ServiceRegistry::new(cluster, Duration::from_secs(360))
    }

    #[tokio::test]
    async fn test_get_or_init_lists_once_and_caches() {
        let cluster = Arc::new(FakeCluster::with_pods(vec![pod("p1", "10.1.0.1", "10.0.0.1")]));
        let registry = registry(cluster.clone());

        let first = registry.get_or_init("test", "svc").await.unwrap();
        let second = registry.get_or_init("test", "svc").await.unwrap();

        assert_eq!(first.pods, second.pods);
        assert_eq!(first.target_port, "8080");
        assert_eq!(cluster.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.handlers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_init_error_propagates() {
        let cluster = Arc::new(FakeCluster::unavailable());
        let registry = registry(cluster);

        assert!(registry.get_or_init("test", "svc").await.is_err());
    }

    #[tokio::test]
    async fn test_watch_install_failure_drops_entry() {
        let cluster = Arc::new(FakeCluster::with_pods(vec![pod("p1", "10.1.0.1", "10.0.0.1")]));
        cluster.fail_watch.store(true, Ordering::SeqCst);
        let registry = registry(cluster.clone());

        assert!(registry.get_or_init("test", "svc").await.is_err());
        assert!(registry.entries.is_empty());

        // Once the watch can be installed again the next call recovers.
        cluster.fail_watch.store(false, Ordering::SeqCst);
        assert!(registry.get_or_init("test", "svc").await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_events_mutate_pod_list() {
        let cluster = Arc::new(FakeCluster::with_pods(vec![pod("p1", "10.1.0.1", "10.0.0.1")]));
        let registry = registry(cluster.clone());
        registry.get_or_init("test", "svc").await.unwrap();

        cluster.send_event(PodEvent::Added(pod("p2", "10.1.0.2", "10.0.0.2")));
        cluster.send_event(PodEvent::Updated(pod("p1", "10.1.0.9", "10.0.0.1")));
        cluster.send_event(PodEvent::Deleted(pod("p1", "10.1.0.9", "10.0.0.1")));

        let snapshot = registry.get_or_init("test", "svc").await.unwrap();
        assert_eq!(snapshot.pods, vec![pod("p2", "10.1.0.2", "10.0.0.2")]);
    }

    #[test]
    fn test_apply_event_add_is_idempotent() {
        let mut pods = Vec::new();
        apply_event(&mut pods, PodEvent::Added(pod("p1", "10.1.0.1", "10.0.0.1")));
        apply_event(&mut pods, PodEvent::Added(pod("p1", "10.1.0.1", "10.0.0.1")));
        assert_eq!(pods.len(), 1);
    }

    #[test]
    fn test_apply_event_update_replaces_by_name() {
        let mut pods = vec![pod("p1", "10.1.0.1", "10.0.0.1")];
        apply_event(&mut pods, PodEvent::Updated(pod("p1", "10.1.0.5", "10.0.0.1")));
        assert_eq!(pods[0].pod_ip, "10.1.0.5");
    }

    #[test]
    fn test_apply_event_update_of_unknown_pod_is_noop() {
        let mut pods = vec![pod("p1", "10.1.0.1", "10.0.0.1")];
        apply_event(&mut pods, PodEvent::Updated(pod("p9", "10.1.0.9", "10.0.0.9")));
        assert_eq!(pods, vec![pod("p1", "10.1.0.1", "10.0.0.1")]);
    }

    #[test]
    fn test_apply_event_delete_of_absent_pod_is_noop() {
        let mut pods = vec![pod("p1", "10.1.0.1", "10.0.0.1")];
        apply_event(&mut pods, PodEvent::Deleted(pod("p9", "10.1.0.9", "10.0.0.9")));
        assert_eq!(pods.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_evicted_and_watch_stopped() {
        let cluster = Arc::new(FakeCluster::with_pods(vec![pod("p1", "10.1.0.1", "10.0.0.1")]));
        let registry = registry(cluster.clone());
        registry.get_or_init("test", "svc").await.unwrap();

        tokio::time::advance(Duration::from_secs(361)).await;
        registry.evict_idle();

        assert!(registry.entries.is_empty());
        assert!(cluster.watch_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_entry_survives_sweep() {
        let cluster = Arc::new(FakeCluster::with_pods(vec![pod("p1", "10.1.0.1", "10.0.0.1")]));
        let registry = registry(cluster.clone());
        registry.get_or_init("test", "svc").await.unwrap();

        tokio::time::advance(Duration::from_secs(300)).await;
        // A request inside the hold window resets the idle clock.
        registry.get_or_init("test", "svc").await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        registry.evict_idle();

        assert_eq!(registry.entries.len(), 1);
        assert!(!cluster.watch_stopped.load(Ordering::SeqCst));
    }
}
