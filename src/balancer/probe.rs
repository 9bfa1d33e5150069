//! Out-of-band host RTT probes with a short-lived per-host cache.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const PING_PATH: &str = "/echo?param1=value1&param2=value2";

/// Measures host round-trip time by fetching the peer proxy's echo endpoint.
///
/// Successful measurements are cached per host for `cache_ttl` so repeated
/// approximation runs do not hammer the network; failures are never cached.
pub struct PingProbe {
    http: reqwest::Client,
    cache: DashMap<String, PingCacheEntry>,
    ping_port: u16,
    cache_ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PingCacheEntry {
    cached_at: Instant,
    latency_ms: u64,
}

impl PingProbe {
    pub fn new(ping_port: u16, timeout: Duration, cache_ttl: Duration) -> anyhow::Result<Self> {
        // Probes target node-local addresses; an ambient HTTP proxy would
        // distort the measurement.
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            cache: DashMap::new(),
            ping_port,
            cache_ttl,
        })
    }

    /// Round-trip time to the host's echo endpoint in whole milliseconds.
    /// `None` means the host did not answer in time.
    pub async fn measure(&self, host_ip: &str) -> Option<u64> {
        if let Some(entry) = self.cache.get(host_ip) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                tracing::debug!(host = host_ip, latency_ms = entry.latency_ms, "using cached ping");
                return Some(entry.latency_ms);
            }
        }

        let latency_ms = self.ping(host_ip).await?;
        self.cache.insert(
            host_ip.to_string(),
            PingCacheEntry {
                cached_at: Instant::now(),
                latency_ms,
            },
        );
        Some(latency_ms)
    }

    /// Wall time from request start to body fully read.
    async fn ping(&self, host_ip: &str) -> Option<u64> {
        let url = format!("http://{}:{}{}", host_ip, self.ping_port, PING_PATH);
        let start = Instant::now();

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(host = host_ip, %error, "ping request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(host = host_ip, status = %response.status(), "ping answered non-2xx");
            return None;
        }
        if let Err(error) = response.bytes().await {
            tracing::debug!(host = host_ip, %error, "ping body read failed");
            return None;
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(host = host_ip, latency_ms, "pinged host");
        Some(latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers exactly one HTTP request on the listener, then exits.
    async fn serve_once(listener: TcpListener, status_line: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).await;
        let body = "{}";
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    }

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn probe(port: u16) -> PingProbe {
        PingProbe::new(
            port,
            Duration::from_millis(500),
            Duration::from_secs(100),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_measure_successful_ping() {
        let (listener, port) = local_listener().await;
        tokio::spawn(serve_once(listener, "200 OK"));

        let result = probe(port).measure("127.0.0.1").await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_measure_non_2xx_is_unreachable() {
        let (listener, port) = local_listener().await;
        tokio::spawn(serve_once(listener, "503 Service Unavailable"));

        assert!(probe(port).measure("127.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_measure_refused_connection_is_unreachable() {
        let (listener, port) = local_listener().await;
        drop(listener);

        assert!(probe(port).measure("127.0.0.1").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_satisfies_second_measure_without_network() {
        let (listener, port) = local_listener().await;
        tokio::spawn(serve_once(listener, "200 OK"));

        let probe = probe(port);
        let first = probe.measure("127.0.0.1").await.unwrap();
        // The listener answered once and is gone; only the cache can answer now.
        let second = probe.measure("127.0.0.1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let (listener, port) = local_listener().await;
        drop(listener);

        let probe = probe(port);
        assert!(probe.measure("127.0.0.1").await.is_none());
        assert!(probe.cache.is_empty());
    }
}
