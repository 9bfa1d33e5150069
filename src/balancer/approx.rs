//! Latency approximation pass over a service's hosts.

use std::collections::HashMap;

use crate::balancer::probe::PingProbe;
use crate::balancer::store::HostRecord;
use crate::cluster::PodRef;

/// Estimates latency for every distinct host backing the given pods.
///
/// Each host is probed at most once per pass (the probe consults its own
/// cache first); hosts that do not answer are clamped to `max_latency_ms`
/// without polluting the cache. All produced records are flagged as
/// approximated and healthy.
pub(crate) async fn approximate_latencies(
    probe: &PingProbe,
    pods: &[PodRef],
    max_latency_ms: u64,
) -> HashMap<String, HostRecord> {
    let mut result: HashMap<String, HostRecord> = HashMap::new();

    for pod in pods {
        if result.contains_key(&pod.host_ip) {
            continue;
        }
        let latency_ms = match probe.measure(&pod.host_ip).await {
            Some(latency_ms) => latency_ms,
            None => max_latency_ms,
        };
        result.insert(pod.host_ip.clone(), HostRecord::approximated(latency_ms));
    }

    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::cluster::testutil::pod;

    async fn serve_n(listener: TcpListener, answers: usize) {
        for _ in 0..answers {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response =
                "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";
            stream.write_all(response.as_bytes()).await.unwrap();
        }
    }

    fn probe(port: u16) -> PingProbe {
        PingProbe::new(port, Duration::from_millis(300), Duration::from_secs(100)).unwrap()
    }

    #[tokio::test]
    async fn test_one_record_per_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // A single answer: probing the shared host twice would hang and fail.
        tokio::spawn(serve_n(listener, 1));

        let pods = vec![
            pod("p1", "10.1.0.1", "127.0.0.1"),
            pod("p2", "10.1.0.2", "127.0.0.1"),
        ];
        let result = approximate_latencies(&probe(port), &pods, 300).await;

        assert_eq!(result.len(), 1);
        let record = &result["127.0.0.1"];
        assert!(record.approximated);
        assert!(record.healthy);
        assert_eq!(record.failed_count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_host_clamped_to_max_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pods = vec![pod("p1", "10.1.0.1", "127.0.0.1")];
        let result = approximate_latencies(&probe(port), &pods, 300).await;

        let record = &result["127.0.0.1"];
        assert_eq!(record.latency_ms, 300);
        assert!(record.approximated);
        assert!(record.healthy);
    }
}
