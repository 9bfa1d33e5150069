//! Orchestrator-facing types and the view the balancer consumes.
//!
//! The balancer never talks to the API server directly; everything it needs
//! from the cluster goes through [`ClusterView`], so the selection engine can
//! be exercised against an in-memory cluster in tests.

pub mod kube;
pub mod nodes;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

/// One running instance of a service, bound to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
    pub pod_ip: String,
    pub host_ip: String,
}

/// CPU and RAM utilization of a node as fractions of its capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeMetric {
    pub cpu_usage: f64,
    pub ram_usage: f64,
}

/// Result of listing a service: its pods plus the routing metadata the
/// selector needs.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub pods: Vec<PodRef>,
    pub annotations: HashMap<String, String>,
    pub target_port: String,
    /// Label selector matching the service's pods; scopes the watch.
    pub selector: String,
}

/// Membership change delivered by a pod watch.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(PodRef),
    Updated(PodRef),
    Deleted(PodRef),
}

/// Callback invoked for each watch event. Events for one service arrive
/// serially; the handler is the sole writer of that service's pod list.
pub type PodEventHandler = Arc<dyn Fn(PodEvent) + Send + Sync>;

/// Stops the underlying watch when invoked or dropped.
pub struct WatchHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// The cluster could not serve the request. Callers degrade — reuse cached
/// data or report "no pod" — instead of aborting.
#[derive(Debug, thiserror::Error)]
#[error("cluster unavailable: {0}")]
pub struct Unavailable(pub String);

/// What the balancer needs from the orchestrator.
#[async_trait]
pub trait ClusterView: Send + Sync + 'static {
    /// Single-shot listing of a service's pods and routing metadata.
    async fn list_pods_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<ServiceEndpoints, Unavailable>;

    /// Streams membership changes for pods matching `label_selector` until the
    /// returned handle is stopped.
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        handler: PodEventHandler,
    ) -> Result<WatchHandle, Unavailable>;

    /// Current CPU/RAM utilization per node, keyed by host IP.
    async fn list_node_metrics(&self) -> Result<HashMap<String, NodeMetric>, Unavailable>;
}
