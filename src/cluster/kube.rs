//! Kubernetes-backed [`ClusterView`].
//!
//! Pods and services come from the core API; node utilization is assembled
//! from `metrics.k8s.io` usage divided by node capacity, keyed by each
//! node's InternalIP.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, NodeStatus, Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::Client;
use serde::Deserialize;

use super::{
    ClusterView, NodeMetric, PodEvent, PodEventHandler, PodRef, ServiceEndpoints, Unavailable,
    WatchHandle,
};

const NODE_METRICS_PATH: &str = "/apis/metrics.k8s.io/v1beta1/nodes";

pub struct KubeClusterView {
    client: Client,
}

impl KubeClusterView {
    /// Connects using in-cluster configuration or the local kubeconfig.
    pub async fn connect() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn list_pods_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceEndpoints, Unavailable> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = services.get(service).await.map_err(unavailable)?;

        let spec = svc.spec.unwrap_or_default();
        let selector = format_selector(&spec.selector.unwrap_or_default());
        let target_port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|port| match &port.target_port {
                Some(target) => int_or_string(target),
                None => port.port.to_string(),
            })
            .unwrap_or_default();
        let annotations = svc
            .metadata
            .annotations
            .unwrap_or_default()
            .into_iter()
            .collect();

        let pods_api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let listed = pods_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(unavailable)?;
        let pods = listed.items.iter().filter_map(pod_ref).collect();

        Ok(ServiceEndpoints {
            pods,
            annotations,
            target_port,
            selector,
        })
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        handler: PodEventHandler,
    ) -> Result<WatchHandle, Unavailable> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let config = watcher::Config::default().labels(label_selector);
        let namespace = namespace.to_string();

        let task = tokio::spawn(async move {
            let mut stream = watcher::watcher(pods, config).boxed();
            // Names currently known to the consumer, so Apply events can be
            // split into adds and updates the way the handler expects.
            let mut seen: HashSet<String> = HashSet::new();
            // Names observed during a (re)list cycle; used to synthesize
            // deletes for pods that vanished while the watch was down.
            let mut resync: Option<HashSet<String>> = None;

            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Init) => resync = Some(HashSet::new()),
                    Ok(watcher::Event::InitApply(pod)) => {
                        if let Some(pod) = pod_ref(&pod) {
                            if let Some(resync) = resync.as_mut() {
                                resync.insert(pod.name.clone());
                            }
                            handler(classify(&mut seen, pod));
                        }
                    }
                    Ok(watcher::Event::InitDone) => {
                        if let Some(current) = resync.take() {
                            let gone: Vec<String> =
                                seen.difference(&current).cloned().collect();
                            for name in gone {
                                seen.remove(&name);
                                handler(PodEvent::Deleted(PodRef {
                                    name,
                                    namespace: namespace.clone(),
                                    pod_ip: String::new(),
                                    host_ip: String::new(),
                                }));
                            }
                        }
                    }
                    Ok(watcher::Event::Apply(pod)) => {
                        if let Some(pod) = pod_ref(&pod) {
                            handler(classify(&mut seen, pod));
                        }
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        if let Some(pod) = deleted_pod_ref(&pod) {
                            seen.remove(&pod.name);
                            handler(PodEvent::Deleted(pod));
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "pod watch error, stream will resume");
                    }
                }
            }
        });

        Ok(WatchHandle::new(move || task.abort()))
    }

    async fn list_node_metrics(&self) -> Result<HashMap<String, NodeMetric>, Unavailable> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes
            .list(&ListParams::default())
            .await
            .map_err(unavailable)?;

        let request = http::Request::get(NODE_METRICS_PATH)
            .body(Vec::new())
            .map_err(unavailable)?;
        let metrics: NodeMetricsList = self.client.request(request).await.map_err(unavailable)?;

        let usage_by_name: HashMap<String, ResourceUsage> = metrics
            .items
            .into_iter()
            .filter_map(|item| Some((item.metadata.name?, item.usage)))
            .collect();

        let mut result = HashMap::new();
        for node in node_list.items {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let Some(usage) = usage_by_name.get(&name) else {
                continue;
            };
            let Some(status) = node.status.as_ref() else {
                continue;
            };
            let Some(host_ip) = internal_ip(status) else {
                continue;
            };
            let Some(capacity) = status.capacity.as_ref() else {
                continue;
            };

            let cpu_capacity = capacity.get("cpu").and_then(|q| parse_cpu(&q.0));
            let mem_capacity = capacity.get("memory").and_then(|q| parse_memory(&q.0));
            let (Some(cpu_capacity), Some(mem_capacity)) = (cpu_capacity, mem_capacity) else {
                continue;
            };
            if cpu_capacity <= 0.0 || mem_capacity <= 0.0 {
                continue;
            }
            let (Some(cpu_usage), Some(mem_usage)) =
                (parse_cpu(&usage.cpu), parse_memory(&usage.memory))
            else {
                continue;
            };

            result.insert(
                host_ip,
                NodeMetric {
                    cpu_usage: cpu_usage / cpu_capacity,
                    ram_usage: mem_usage / mem_capacity,
                },
            );
        }

        Ok(result)
    }
}

/// Usage half of the `metrics.k8s.io` node metrics payload.
#[derive(Debug, Deserialize)]
struct NodeMetricsList {
    #[serde(default)]
    items: Vec<NodeMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsItem {
    metadata: NodeMetricsMeta,
    usage: ResourceUsage,
}

#[derive(Debug, Deserialize)]
struct NodeMetricsMeta {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceUsage {
    cpu: String,
    memory: String,
}

fn unavailable(error: impl std::fmt::Display) -> Unavailable {
    Unavailable(error.to_string())
}

fn classify(seen: &mut HashSet<String>, pod: PodRef) -> PodEvent {
    if seen.insert(pod.name.clone()) {
        PodEvent::Added(pod)
    } else {
        PodEvent::Updated(pod)
    }
}

/// Pod with both IPs assigned; pods still scheduling are skipped.
fn pod_ref(pod: &Pod) -> Option<PodRef> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref()?;
    let pod_ip = status.pod_ip.clone()?;
    let host_ip = status.host_ip.clone()?;
    Some(PodRef {
        name,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        pod_ip,
        host_ip,
    })
}

/// Deletes match by name, so missing IPs on a terminating pod are fine.
fn deleted_pod_ref(pod: &Pod) -> Option<PodRef> {
    let name = pod.metadata.name.clone()?;
    let status = pod.status.as_ref();
    Some(PodRef {
        name,
        namespace: pod.metadata.namespace.clone().unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        host_ip: status.and_then(|s| s.host_ip.clone()).unwrap_or_default(),
    })
}

fn internal_ip(status: &NodeStatus) -> Option<String> {
    status
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == "InternalIP")
        .map(|address| address.address.clone())
}

fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn int_or_string(value: &IntOrString) -> String {
    match value {
        IntOrString::Int(port) => port.to_string(),
        IntOrString::String(name) => name.clone(),
    }
}

/// Kubernetes CPU quantity in cores ("250m", "123456789n", "2").
fn parse_cpu(quantity: &str) -> Option<f64> {
    if let Some(value) = quantity.strip_suffix('n') {
        return Some(value.parse::<f64>().ok()? / 1e9);
    }
    if let Some(value) = quantity.strip_suffix('u') {
        return Some(value.parse::<f64>().ok()? / 1e6);
    }
    if let Some(value) = quantity.strip_suffix('m') {
        return Some(value.parse::<f64>().ok()? / 1e3);
    }
    quantity.parse().ok()
}

/// Kubernetes memory quantity in bytes ("16252928Ki", "4Gi", "1500M", "1024").
fn parse_memory(quantity: &str) -> Option<f64> {
    const BINARY: [(&str, f64); 6] = [
        ("Ki", 1024.0),
        ("Mi", 1048576.0),
        ("Gi", 1073741824.0),
        ("Ti", 1099511627776.0),
        ("Pi", 1125899906842624.0),
        ("Ei", 1152921504606846976.0),
    ];
    const DECIMAL: [(&str, f64); 6] = [
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];

    for (suffix, factor) in BINARY {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return Some(value.parse::<f64>().ok()? * factor);
        }
    }
    for (suffix, factor) in DECIMAL {
        if let Some(value) = quantity.strip_suffix(suffix) {
            return Some(value.parse::<f64>().ok()? * factor);
        }
    }
    quantity.parse().ok()
}
