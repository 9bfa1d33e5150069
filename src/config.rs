//! Environment-driven settings for the balancer and its caches.
//!
//! Every tunable has a documented default; a value that fails to parse is
//! logged and replaced by that default. Only `NODE_IP` and `NAMESPACE` are
//! required — without them the proxy cannot route at all.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

const DEFAULT_QOS_PERCENTAGE: f64 = 0.3;
const DEFAULT_LATENCY_WEIGHT: f64 = 0.2;
const DEFAULT_LATENCY_APPR_WEIGHT: f64 = 0.7;
const DEFAULT_COOLDOWN_BASE_S: u64 = 30;
const DEFAULT_REAL_DATA_VALID_S: u64 = 360;
const DEFAULT_PING_TIMEOUT_S: u64 = 1;
const DEFAULT_PING_CACHE_TIME_S: u64 = 100;
const DEFAULT_QOS_COOLDOWN_S: u64 = 60;
const DEFAULT_RANDOM_MODE: bool = true;
const DEFAULT_CACHE_HOLD_TIME_S: u64 = 360;
const DEFAULT_NODE_METRICS_CACHE_TIME_S: u64 = 60;

/// Resolved configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// IP of the node this proxy runs on; used for the local-preference fallback.
    pub node_ip: String,
    /// Namespace scoping all service lookups.
    pub namespace: String,
    /// Minimum fraction of pods that must be usable before QoS is satisfied.
    pub qos_percentage: f64,
    /// EMA weight for a real sample when the prior value was real.
    pub latency_weight: f64,
    /// EMA weight for a real sample when the prior value was approximated.
    pub latency_appr_weight: f64,
    /// Per-failure multiplier for the cooldown window.
    pub cooldown_base: Duration,
    /// Age beyond which a real record may be overwritten by an approximation.
    pub real_data_valid: Duration,
    pub ping_timeout: Duration,
    pub ping_cache_time: Duration,
    /// Minimum interval between QoS-triggered recalculations per service.
    pub qos_cooldown: Duration,
    /// Pick randomly among QoS-good pods instead of lowest-latency.
    pub random_mode: bool,
    /// Idle TTL before a cached service entry is evicted.
    pub cache_hold_time: Duration,
    /// Node-metrics refresh interval.
    pub node_metrics_cache_time: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            node_ip: require("NODE_IP")?,
            namespace: require("NAMESPACE")?,
            qos_percentage: env_or("QOS_PERC", DEFAULT_QOS_PERCENTAGE),
            latency_weight: env_or("LAT_WEIGHT", DEFAULT_LATENCY_WEIGHT),
            latency_appr_weight: env_or("LAT_APPR_WEIGHT", DEFAULT_LATENCY_APPR_WEIGHT),
            cooldown_base: Duration::from_secs(env_or(
                "COOLDOWN_BASE_DURATION_S",
                DEFAULT_COOLDOWN_BASE_S,
            )),
            real_data_valid: Duration::from_secs(env_or(
                "REAL_DATA_VALID_S",
                DEFAULT_REAL_DATA_VALID_S,
            )),
            ping_timeout: Duration::from_secs(env_or("PING_TIMEOUT_S", DEFAULT_PING_TIMEOUT_S)),
            ping_cache_time: Duration::from_secs(env_or(
                "PING_CACHE_TIME_S",
                DEFAULT_PING_CACHE_TIME_S,
            )),
            qos_cooldown: Duration::from_secs(env_or("QOS_COOLDOWN_S", DEFAULT_QOS_COOLDOWN_S)),
            random_mode: env_or("RANDOM_MODE", DEFAULT_RANDOM_MODE),
            cache_hold_time: Duration::from_secs(env_or(
                "CACHE_HOLD_TIME_S",
                DEFAULT_CACHE_HOLD_TIME_S,
            )),
            node_metrics_cache_time: Duration::from_secs(env_or(
                "NODE_METRICS_CACHE_TIME_S",
                DEFAULT_NODE_METRICS_CACHE_TIME_S,
            )),
        })
    }
}

fn require(key: &str) -> Result<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => bail!("required environment variable {key} is not set"),
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    let value = match std::env::var(key) {
        Ok(raw) => parse_or_default(key, &raw, default),
        Err(_) => default,
    };
    tracing::info!("{key}: {value}");
    value
}

fn parse_or_default<T>(key: &str, raw: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("invalid value {raw:?} for {key}, falling back to {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_value() {
        assert_eq!(parse_or_default("QOS_PERC", "0.5", 0.3), 0.5);
        assert_eq!(parse_or_default("COOLDOWN_BASE_DURATION_S", "45", 30u64), 45);
        assert!(!parse_or_default("RANDOM_MODE", "false", true));
    }

    #[test]
    fn test_parse_invalid_value_falls_back() {
        assert_eq!(parse_or_default("QOS_PERC", "lots", 0.3), 0.3);
        assert_eq!(parse_or_default("COOLDOWN_BASE_DURATION_S", "-1", 30u64), 30);
        assert!(parse_or_default("RANDOM_MODE", "yes", true));
    }

    #[test]
    fn test_parse_empty_value_falls_back() {
        assert_eq!(parse_or_default("LAT_WEIGHT", "", 0.2), 0.2);
    }
}
