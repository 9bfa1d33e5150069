//! Per-(host, service) latency and health bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Latency and health state for one service on one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    pub latency_ms: u64,
    /// The latency came from a probe rather than real traffic.
    pub approximated: bool,
    pub healthy: bool,
    pub failed_count: u32,
    pub last_update: Instant,
}

impl HostRecord {
    /// Record produced by the approximation worker.
    pub(crate) fn approximated(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            approximated: true,
            healthy: true,
            failed_count: 0,
            last_update: Instant::now(),
        }
    }
}

/// Shared store of [`HostRecord`]s.
///
/// All mutation of one record goes through this store, which serializes it
/// per key; the single-flight gate around the approximation worker is a
/// separate concern and protects nothing here.
pub struct LatencyStore {
    records: DashMap<(String, String), HostRecord>,
    latency_weight: f64,
    latency_appr_weight: f64,
    real_data_valid: Duration,
    cooldown_base: Duration,
}

impl LatencyStore {
    pub fn new(
        latency_weight: f64,
        latency_appr_weight: f64,
        real_data_valid: Duration,
        cooldown_base: Duration,
    ) -> Self {
        Self {
            records: DashMap::new(),
            latency_weight,
            latency_appr_weight,
            real_data_valid,
            cooldown_base,
        }
    }

    pub fn get(&self, host_ip: &str, service: &str) -> Option<HostRecord> {
        self.records.get(&key(host_ip, service)).map(|r| r.clone())
    }

    /// Folds a real measurement into the record via EMA. A prior estimate
    /// that came from a probe is weighted down harder than a real one.
    pub fn observe(&self, host_ip: &str, service: &str, measured_ms: u64) {
        let now = Instant::now();
        match self.records.entry(key(host_ip, service)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let weight = if record.approximated {
                    self.latency_appr_weight
                } else {
                    self.latency_weight
                };
                let blended =
                    (1.0 - weight) * record.latency_ms as f64 + weight * measured_ms as f64;
                record.latency_ms = blended.round() as u64;
                record.approximated = false;
                record.healthy = true;
                record.failed_count = 0;
                record.last_update = now;
                tracing::debug!(
                    host = host_ip,
                    service,
                    measured_ms,
                    latency_ms = record.latency_ms,
                    "blended latency sample"
                );
            }
            Entry::Vacant(slot) => {
                slot.insert(HostRecord {
                    latency_ms: measured_ms,
                    approximated: false,
                    healthy: true,
                    failed_count: 0,
                    last_update: now,
                });
                tracing::debug!(host = host_ip, service, measured_ms, "first latency sample");
            }
        }
    }

    /// Marks a failed request: the host goes unhealthy and its consecutive
    /// failure counter grows, lengthening the cooldown. Latency is untouched.
    pub fn mark_failed(&self, host_ip: &str, service: &str) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(key(host_ip, service))
            .or_insert(HostRecord {
                latency_ms: 0,
                approximated: false,
                healthy: true,
                failed_count: 0,
                last_update: now,
            });
        record.healthy = false;
        record.failed_count += 1;
        record.last_update = now;
        tracing::debug!(
            host = host_ip,
            service,
            failed_count = record.failed_count,
            "request failed, host on cooldown"
        );
    }

    /// Merges a probe-derived map. Estimates only displace records that are
    /// themselves approximated or older than the real-data validity window;
    /// recent real data always wins.
    pub fn apply_approximation(&self, service: &str, fresh: HashMap<String, HostRecord>) {
        let now = Instant::now();
        for (host_ip, incoming) in fresh {
            match self.records.entry((host_ip, service.to_string())) {
                Entry::Occupied(mut entry) => {
                    let record = entry.get_mut();
                    let stale = now.duration_since(record.last_update) > self.real_data_valid;
                    if stale || record.approximated {
                        record.latency_ms = incoming.latency_ms;
                        record.approximated = incoming.approximated;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(incoming);
                }
            }
        }
    }

    /// Whether the host is excluded from selection: unhealthy and inside a
    /// window of `cooldown_base * failed_count` since the last failure.
    pub fn is_in_cooldown(&self, host_ip: &str, service: &str) -> bool {
        match self.get(host_ip, service) {
            Some(record) => {
                !record.healthy
                    && record.last_update.elapsed() < self.cooldown_base * record.failed_count
            }
            None => false,
        }
    }
}

fn key(host_ip: &str, service: &str) -> (String, String) {
    (host_ip.to_string(), service.to_string())
}
