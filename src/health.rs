//! HTTP health server for Kubernetes probes.
//!
//! `/healthz` answers as long as the process is alive; `/readyz` only once
//! the node-metrics cache has produced its first snapshot, so a freshly
//! scheduled proxy is not handed traffic before it can see the cluster.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::cluster::nodes::NodeStatusCache;

/// Handles health check requests.
///
/// Returns 200 "ok" for `/healthz`; `/readyz` is 200 once node metrics have
/// been fetched at least once and 503 before that. Other paths are 404.
pub async fn health_handler(
    req: Request<hyper::body::Incoming>,
    nodes: Arc<NodeStatusCache>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .unwrap(),
        "/readyz" => {
            if nodes.is_ready() {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::from("ok")))
                    .unwrap()
            } else {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Full::new(Bytes::from("waiting for node metrics")))
                    .unwrap()
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(
    addr: SocketAddr,
    nodes: Arc<NodeStatusCache>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let nodes = nodes.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, nodes.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}
