//! Pod selection: the latency/QoS policy over cached cluster state.

mod approx;
pub mod probe;
pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cluster::nodes::NodeStatusCache;
use crate::cluster::registry::ServiceRegistry;
use crate::cluster::PodRef;
use crate::config::Settings;
use probe::PingProbe;
use store::{HostRecord, LatencyStore};

const DEFAULT_MAX_LATENCY_MS: u64 = 300;
const OVERLOAD_THRESHOLD: f64 = 0.9;

/// The backend chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub pod_ip: String,
    pub host_ip: String,
    pub target_port: String,
}

/// Per-service bookkeeping for the approximation worker.
///
/// `approx_running` is the single-flight gate: a worker may only be spawned
/// by whoever moves it false→true, and it goes false again only after the
/// serving path drains the result channel. The channel holds at most the one
/// outstanding result, so a send never waits behind a stale one.
struct ServiceRuntime {
    approx_running: AtomicBool,
    tx: mpsc::Sender<HashMap<String, HostRecord>>,
    rx: Mutex<mpsc::Receiver<HashMap<String, HostRecord>>>,
    last_qos_recalc: Mutex<Instant>,
}

/// Latency- and load-aware pod selector.
///
/// Holds the per-(host, service) latency model, the node pressure snapshot
/// and the service cache, and runs the multi-tier selection policy with its
/// QoS fallback.
pub struct Balancer {
    own_ip: String,
    registry: Arc<ServiceRegistry>,
    nodes: Arc<NodeStatusCache>,
    store: LatencyStore,
    probe: Arc<PingProbe>,
    services: DashMap<String, Arc<ServiceRuntime>>,
    qos_percentage: f64,
    qos_cooldown: Duration,
    random_mode: bool,
}

impl Balancer {
    pub fn new(
        settings: &Settings,
        registry: Arc<ServiceRegistry>,
        nodes: Arc<NodeStatusCache>,
        probe: Arc<PingProbe>,
    ) -> Self {
        Self {
            own_ip: settings.node_ip.clone(),
            registry,
            nodes,
            store: LatencyStore::new(
                settings.latency_weight,
                settings.latency_appr_weight,
                settings.real_data_valid,
                settings.cooldown_base,
            ),
            probe,
            services: DashMap::new(),
            qos_percentage: settings.qos_percentage,
            qos_cooldown: settings.qos_cooldown,
            random_mode: settings.random_mode,
        }
    }

    /// Feeds a measured round-trip back into the latency model.
    pub fn observe(&self, host_ip: &str, service: &str, latency_ms: u64) {
        self.store.observe(host_ip, service, latency_ms);
    }

    /// Reports a failed request, putting the host on cooldown for the service.
    pub fn mark_failed(&self, host_ip: &str, service: &str) {
        self.store.mark_failed(host_ip, service);
    }

    /// Selects one pod of `service`, or `None` when nothing is selectable.
    pub async fn choose_pod(&self, namespace: &str, service: &str) -> Option<Selection> {
        let snapshot = match self.registry.get_or_init(namespace, service).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, service, "failed to retrieve pods for service");
                return None;
            }
        };

        let max_latency_ms = snapshot
            .annotations
            .get("maxLatency")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_MAX_LATENCY_MS);

        let healthy: Vec<PodRef> = snapshot
            .pods
            .iter()
            .filter(|p| !self.store.is_in_cooldown(&p.host_ip, service))
            .cloned()
            .collect();
        if healthy.is_empty() {
            tracing::info!(service, "no pods outside cooldown");
            return None;
        }

        let runtime = self.drain_or_bootstrap(service, &snapshot.pods, max_latency_ms);

        // Partition pods with a known latency inside the budget by node
        // pressure; pods without a record (or over budget) drop out here and
        // are only reachable through the tail fallbacks.
        let node_status = self.nodes.get();
        let mut best: Vec<(&PodRef, u64)> = Vec::new();
        let mut overloaded: Vec<&PodRef> = Vec::new();
        for pod in &healthy {
            let Some(record) = self.store.get(&pod.host_ip, service) else {
                continue;
            };
            if record.latency_ms >= max_latency_ms {
                continue;
            }
            let pressured = node_status
                .get(&pod.host_ip)
                .is_some_and(|m| m.cpu_usage > OVERLOAD_THRESHOLD || m.ram_usage > OVERLOAD_THRESHOLD);
            if pressured {
                overloaded.push(pod);
            } else {
                best.push((pod, record.latency_ms));
            }
        }

        self.maybe_recalculate(
            &runtime,
            service,
            &snapshot.pods,
            best.len() + overloaded.len(),
            healthy.len(),
            max_latency_ms,
        );

        self.pick(service, best, overloaded, &healthy)
            .map(|pod| Selection {
                pod_ip: pod.pod_ip.clone(),
                host_ip: pod.host_ip.clone(),
                target_port: snapshot.target_port.clone(),
            })
    }

    /// First call for a service spawns the initial approximation run; later
    /// calls drain a finished result, if any, without blocking.
    fn drain_or_bootstrap(
        &self,
        service: &str,
        all_pods: &[PodRef],
        max_latency_ms: u64,
    ) -> Arc<ServiceRuntime> {
        match self.services.entry(service.to_string()) {
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(1);
                let runtime = Arc::new(ServiceRuntime {
                    approx_running: AtomicBool::new(true),
                    tx,
                    rx: Mutex::new(rx),
                    last_qos_recalc: Mutex::new(Instant::now()),
                });
                slot.insert(runtime.clone());
                self.spawn_worker(&runtime, all_pods.to_vec(), max_latency_ms, service);
                runtime
            }
            Entry::Occupied(entry) => {
                let runtime = entry.get().clone();
                drop(entry);
                let drained = runtime
                    .rx
                    .lock()
                    .expect("approx receiver lock")
                    .try_recv()
                    .ok();
                if let Some(result) = drained {
                    // Release the single-flight gate before merging, matching
                    // the order requests observe the two effects in.
                    runtime.approx_running.store(false, Ordering::Release);
                    self.store.apply_approximation(service, result);
                    tracing::debug!(service, "merged approximated latencies");
                }
                runtime
            }
        }
    }

    /// Re-runs the approximation when too few pods meet the latency budget,
    /// rate-limited per service and gated by the single-flight flag.
    fn maybe_recalculate(
        &self,
        runtime: &Arc<ServiceRuntime>,
        service: &str,
        all_pods: &[PodRef],
        usable: usize,
        healthy: usize,
        max_latency_ms: u64,
    ) {
        if usable as f64 / healthy as f64 >= self.qos_percentage {
            return;
        }
        let since_last = runtime
            .last_qos_recalc
            .lock()
            .expect("qos stamp lock")
            .elapsed();
        if since_last <= self.qos_cooldown {
            return;
        }
        if runtime
            .approx_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *runtime.last_qos_recalc.lock().expect("qos stamp lock") = Instant::now();
        tracing::info!(
            service,
            usable,
            healthy,
            "qos minimum breached, refreshing latency estimates"
        );
        self.spawn_worker(runtime, all_pods.to_vec(), max_latency_ms, service);
    }

    fn spawn_worker(
        &self,
        runtime: &Arc<ServiceRuntime>,
        pods: Vec<PodRef>,
        max_latency_ms: u64,
        service: &str,
    ) {
        let probe = self.probe.clone();
        let tx = runtime.tx.clone();
        let service = service.to_string();
        tokio::spawn(async move {
            tracing::debug!(service = %service, hosts = pods.len(), "approximating host latencies");
            let result = approx::approximate_latencies(probe.as_ref(), &pods, max_latency_ms).await;
            if tx.send(result).await.is_err() {
                tracing::warn!(service = %service, "approximation receiver closed, result dropped");
            }
        });
    }

    /// Tiered pick: QoS-good pods first, then overloaded ones, then the pod
    /// on this node, then anything still healthy.
    fn pick<'a>(
        &self,
        service: &str,
        best: Vec<(&'a PodRef, u64)>,
        overloaded: Vec<&'a PodRef>,
        healthy: &'a [PodRef],
    ) -> Option<&'a PodRef> {
        if !best.is_empty() {
            if self.random_mode {
                let index = rand::thread_rng().gen_range(0..best.len());
                return Some(best[index].0);
            }
            let mut chosen = &best[0];
            for candidate in &best[1..] {
                if candidate.1 < chosen.1 {
                    chosen = candidate;
                }
            }
            return Some(chosen.0);
        }

        if !overloaded.is_empty() {
            let index = rand::thread_rng().gen_range(0..overloaded.len());
            return Some(overloaded[index]);
        }

        if let Some(local) = healthy.iter().find(|p| p.host_ip == self.own_ip) {
            tracing::debug!(service, "no pod within latency budget, preferring local node");
            return Some(local);
        }

        let index = rand::thread_rng().gen_range(0..healthy.len());
        Some(&healthy[index])
    }
}
