//! Latency- and load-aware reverse proxy for Kubernetes edge clusters.
//!
//! One proxy runs on every node. Each request is routed to a pod of the
//! service named by the Host header, picked from per-host latency estimates
//! that blend real round-trips with background probes, and demoted by node
//! CPU/RAM pressure.

mod balancer;
mod cluster;
mod config;
mod health;
mod proxy;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::balancer::probe::PingProbe;
use crate::balancer::Balancer;
use crate::cluster::kube::KubeClusterView;
use crate::cluster::nodes::NodeStatusCache;
use crate::cluster::registry::ServiceRegistry;
use crate::cluster::ClusterView;
use crate::config::Settings;
use crate::proxy::EdgeGateway;

/// Node port peer proxies publish their echo endpoint on; probes target it.
const PING_PORT: u16 = 30090;
/// Side port for liveness/readiness probes.
const HEALTH_ADDR: &str = "0.0.0.0:9091";

#[derive(Parser)]
#[command(version, about = "Latency-aware reverse proxy for edge clusters")]
struct Args {
    /// Listen port of the reverse proxy.
    #[arg(short = 'p', long = "port", default_value_t = 9090)]
    port: u16,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::from_env()?;

    tracing::info!("edge-balancer starting");

    // Cluster access and the periodic refreshers live on their own runtime;
    // pingora brings its own for the data plane.
    let background = tokio::runtime::Runtime::new()?;
    let cluster: Arc<dyn ClusterView> = Arc::new(background.block_on(KubeClusterView::connect())?);

    let nodes = Arc::new(NodeStatusCache::new());
    let registry = Arc::new(ServiceRegistry::new(
        cluster.clone(),
        settings.cache_hold_time,
    ));
    let probe = Arc::new(PingProbe::new(
        PING_PORT,
        settings.ping_timeout,
        settings.ping_cache_time,
    )?);
    let balancer = Arc::new(Balancer::new(
        &settings,
        registry.clone(),
        nodes.clone(),
        probe,
    ));

    // Node-metrics refresher, registry janitor and the health server run for
    // the life of the process on the background runtime.
    {
        let nodes = nodes.clone();
        let refresh_every = settings.node_metrics_cache_time;
        std::thread::spawn(move || {
            background.block_on(async move {
                nodes.clone().spawn_refresher(cluster, refresh_every);
                registry.spawn_janitor();

                let addr = HEALTH_ADDR.parse().expect("invalid health address");
                tracing::info!(%addr, "health server listening");
                if let Err(e) = health::start_health_server(addr, nodes).await {
                    tracing::error!(error = %e, "health server error");
                }
            });
        });
    }

    // Create Pingora server
    let opt = Opt::default();
    let mut server = Server::new(Some(opt))?;
    server.bootstrap();

    let gateway = EdgeGateway::new(balancer, settings.namespace.clone());
    let mut proxy_service = http_proxy_service(&server.configuration, gateway);
    let listen = format!("0.0.0.0:{}", args.port);
    proxy_service.add_tcp(&listen);

    tracing::info!(addr = %listen, "reverse proxy listening");

    server.add_service(proxy_service);
    server.run_forever();
}
