//! Pingora ProxyHttp implementation for the edge proxy.
//!
//! The service is addressed by the first dot-separated label of the Host
//! header; the balancer picks which pod of that service gets the request.
//! `/echo` is answered locally and doubles as the ping target for peer
//! proxies probing this node.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, Method, StatusCode};
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::ResponseHeader;
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use tokio::time::Instant;

use crate::balancer::{Balancer, Selection};

/// Per-request context: the selected backend and when we started talking to it.
#[derive(Default)]
pub struct EdgeCtx {
    service: Option<String>,
    selection: Option<Selection>,
    sent_at: Option<Instant>,
}

/// Routes each request to one pod of the service named by the Host header.
pub struct EdgeGateway {
    balancer: Arc<Balancer>,
    namespace: String,
}

impl EdgeGateway {
    pub fn new(balancer: Arc<Balancer>, namespace: String) -> Self {
        Self { balancer, namespace }
    }
}

#[async_trait]
impl ProxyHttp for EdgeGateway {
    type CTX = EdgeCtx;

    fn new_ctx(&self) -> Self::CTX {
        EdgeCtx::default()
    }

    /// Serves the echo endpoint locally; everything else proxies.
    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
        if session.req_header().uri.path() != "/echo" {
            return Ok(false);
        }
        if session.req_header().method != Method::GET {
            session
                .respond_error(StatusCode::METHOD_NOT_ALLOWED.as_u16())
                .await?;
            return Ok(true);
        }

        let body = echo_body(session.req_header().uri.query());
        let mut resp = ResponseHeader::build(StatusCode::OK, None)?;
        resp.insert_header(header::CONTENT_TYPE, "application/json")?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(body.into()), true).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let host_header = session
            .req_header()
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok());
        let authority = session.req_header().uri.authority().map(|a| a.as_str());

        let service = service_from_host(host_header, authority).ok_or_else(|| {
            Error::explain(ErrorType::HTTPStatus(404), "no service in host header")
        })?;

        let selection = self
            .balancer
            .choose_pod(&self.namespace, &service)
            .await
            .ok_or_else(|| {
                Error::explain(
                    ErrorType::HTTPStatus(404),
                    format!("no pod available for service {service}"),
                )
            })?;

        let addr: SocketAddr = format!("{}:{}", selection.pod_ip, selection.target_port)
            .parse()
            .map_err(|e| {
                Error::explain(
                    ErrorType::InternalError,
                    format!("invalid upstream address: {e}"),
                )
            })?;

        tracing::debug!(
            service = %service,
            pod_ip = %selection.pod_ip,
            host_ip = %selection.host_ip,
            "selected pod"
        );

        let peer = HttpPeer::new(addr, false, String::new());
        ctx.service = Some(service);
        ctx.selection = Some(selection);
        ctx.sent_at = Some(Instant::now());
        Ok(Box::new(peer))
    }

    /// Selection failures keep their HTTP status (404); anything that broke
    /// while talking to the upstream surfaces as a plain 500.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        _ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        let code = match e.etype() {
            ErrorType::HTTPStatus(code) => *code,
            _ => 500,
        };
        if let Err(error) = session.respond_error(code).await {
            tracing::error!(%error, "failed to send error response");
        }
        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    /// Runs last on every request: fold the outcome back into the balancer.
    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        if let (Some(selection), Some(service)) = (&ctx.selection, &ctx.service) {
            match e {
                Some(_) => self.balancer.mark_failed(&selection.host_ip, service),
                None => {
                    if let Some(sent_at) = ctx.sent_at {
                        let latency_ms = sent_at.elapsed().as_millis() as u64;
                        self.balancer.observe(&selection.host_ip, service, latency_ms);
                    }
                }
            }
        }

        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        tracing::info!(
            method = session.req_header().method.as_str(),
            path = session.req_header().uri.path(),
            status,
            backend = ctx
                .selection
                .as_ref()
                .map(|s| s.pod_ip.as_str())
                .unwrap_or("-"),
            "request completed"
        );
    }
}

/// First dot-separated label of the request host, port stripped.
///
/// Prefers the Host header, falling back to the HTTP/2 :authority.
fn service_from_host(host_header: Option<&str>, authority: Option<&str>) -> Option<String> {
    let raw = host_header.or(authority)?;
    let host = raw.split(':').next().unwrap_or(raw);
    let label = host.split('.').next().unwrap_or(host);
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

/// JSON object holding the first value of each query parameter.
fn echo_body(query: Option<&str>) -> Vec<u8> {
    let mut response = serde_json::Map::new();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            response
                .entry(key.into_owned())
                .or_insert_with(|| serde_json::Value::String(value.into_owned()));
        }
    }
    serde_json::Value::Object(response).to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Service extraction from the Host header ==========

    #[test]
    fn test_service_is_first_host_label() {
        assert_eq!(
            service_from_host(Some("billing.cluster.local"), None),
            Some("billing".to_string())
        );
    }

    #[test]
    fn test_service_from_bare_host() {
        assert_eq!(
            service_from_host(Some("billing"), None),
            Some("billing".to_string())
        );
    }

    #[test]
    fn test_service_strips_port() {
        assert_eq!(
            service_from_host(Some("billing.cluster.local:9090"), None),
            Some("billing".to_string())
        );
    }

    #[test]
    fn test_service_prefers_host_header_over_authority() {
        assert_eq!(
            service_from_host(Some("billing.a"), Some("orders.b")),
            Some("billing".to_string())
        );
    }

    #[test]
    fn test_service_falls_back_to_authority() {
        assert_eq!(
            service_from_host(None, Some("orders.cluster.local")),
            Some("orders".to_string())
        );
    }

    #[test]
    fn test_service_missing_host_is_none() {
        assert_eq!(service_from_host(None, None), None);
        assert_eq!(service_from_host(Some(""), None), None);
        assert_eq!(service_from_host(Some(".cluster.local"), None), None);
    }

    // ========== Echo payload ==========

    fn echo_json(query: Option<&str>) -> serde_json::Value {
        serde_json::from_slice(&echo_body(query)).unwrap()
    }

    #[test]
    fn test_echo_empty_query_is_empty_object() {
        assert_eq!(echo_json(None), serde_json::json!({}));
        assert_eq!(echo_json(Some("")), serde_json::json!({}));
    }

    #[test]
    fn test_echo_returns_query_parameters() {
        assert_eq!(
            echo_json(Some("param1=value1&param2=value2")),
            serde_json::json!({"param1": "value1", "param2": "value2"})
        );
    }

    #[test]
    fn test_echo_keeps_first_value_per_key() {
        assert_eq!(
            echo_json(Some("k=first&k=second")),
            serde_json::json!({"k": "first"})
        );
    }

    #[test]
    fn test_echo_decodes_percent_encoding() {
        assert_eq!(
            echo_json(Some("greeting=hello%20world")),
            serde_json::json!({"greeting": "hello world"})
        );
    }
}
