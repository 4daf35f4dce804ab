//! Configuration module.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Per-endpoint knobs (interval, timeout, expected status) live on the
//! endpoint rows; everything here is process-wide and fixed at startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::probe::ProbeMethod;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "obsera.db")
    pub db_path: String,
    /// Global cap on concurrent outbound probes (default: 50)
    pub worker_pool_size: usize,
    /// Consecutive failures, at least one `down`, before an outage opens (default: 1)
    pub down_threshold: u32,
    /// Consecutive `degraded`-only failures before an outage opens (default: 3)
    pub degraded_threshold: u32,
    /// Latency above which a matching response counts as degraded (default: 2000ms)
    pub soft_latency_ms: u64,
    /// Probe request method (default: GET)
    pub probe_method: ProbeMethod,
    /// Attempts to persist one health check before giving up (default: 5)
    pub persist_retries: u32,
    /// Reject endpoint deletion when history exists instead of cascading (default: false)
    pub immutable_retention: bool,
    /// Raw health check retention in days (default: 30)
    pub raw_retention_days: u32,
    /// Period of the uptime aggregation loop (default: 60s)
    pub aggregation_interval_secs: u64,
    /// Lifetime of a status page unlock token (default: 3600s)
    pub unlock_token_ttl_secs: u64,
    /// ClickHouse HTTP interface holding traces and logs
    pub clickhouse_url: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    /// Timeout for trace/log store queries (default: 10s)
    pub backend_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "obsera.db".to_string(),
            worker_pool_size: 50,
            down_threshold: 1,
            degraded_threshold: 3,
            soft_latency_ms: 2000,
            probe_method: ProbeMethod::Get,
            persist_retries: 5,
            immutable_retention: false,
            raw_retention_days: 30,
            aggregation_interval_secs: 60,
            unlock_token_ttl_secs: 3600,
            clickhouse_url: "http://localhost:8123".to_string(),
            clickhouse_user: "default".to_string(),
            clickhouse_password: String::new(),
            backend_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `OBSERA_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        override_parsed(&lookup, "OBSERA_HTTP_PORT", &mut cfg.http_port);
        override_parsed(&lookup, "OBSERA_DB_PATH", &mut cfg.db_path);
        override_parsed(&lookup, "OBSERA_WORKER_POOL_SIZE", &mut cfg.worker_pool_size);
        override_parsed(&lookup, "OBSERA_DOWN_THRESHOLD", &mut cfg.down_threshold);
        override_parsed(&lookup, "OBSERA_DEGRADED_THRESHOLD", &mut cfg.degraded_threshold);
        override_parsed(&lookup, "OBSERA_SOFT_LATENCY_MS", &mut cfg.soft_latency_ms);
        override_parsed(&lookup, "OBSERA_PROBE_METHOD", &mut cfg.probe_method);
        override_parsed(&lookup, "OBSERA_PERSIST_RETRIES", &mut cfg.persist_retries);
        override_parsed(&lookup, "OBSERA_IMMUTABLE_RETENTION", &mut cfg.immutable_retention);
        override_parsed(&lookup, "OBSERA_RAW_RETENTION_DAYS", &mut cfg.raw_retention_days);
        override_parsed(&lookup, "OBSERA_AGGREGATION_INTERVAL_SECS", &mut cfg.aggregation_interval_secs);
        override_parsed(&lookup, "OBSERA_UNLOCK_TOKEN_TTL_SECS", &mut cfg.unlock_token_ttl_secs);
        override_parsed(&lookup, "OBSERA_CLICKHOUSE_URL", &mut cfg.clickhouse_url);
        override_parsed(&lookup, "OBSERA_CLICKHOUSE_USER", &mut cfg.clickhouse_user);
        override_parsed(&lookup, "OBSERA_CLICKHOUSE_PASSWORD", &mut cfg.clickhouse_password);
        override_parsed(&lookup, "OBSERA_BACKEND_TIMEOUT_SECS", &mut cfg.backend_timeout_secs);

        // Zero would stall every probe or open outages on no failures.
        cfg.worker_pool_size = cfg.worker_pool_size.max(1);
        cfg.down_threshold = cfg.down_threshold.max(1);
        cfg.degraded_threshold = cfg.degraded_threshold.max(1);
        cfg.persist_retries = cfg.persist_retries.max(1);

        cfg
    }

    pub fn unlock_token_ttl(&self) -> Duration {
        Duration::from_secs(self.unlock_token_ttl_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparsable {}={:?}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "obsera.db");
        assert_eq!(cfg.down_threshold, 1);
        assert_eq!(cfg.probe_method, ProbeMethod::Get);
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("OBSERA_HTTP_PORT", "9090"),
            ("OBSERA_WORKER_POOL_SIZE", "not-a-number"),
            ("OBSERA_PROBE_METHOD", "head"),
            ("OBSERA_IMMUTABLE_RETENTION", "true"),
            ("OBSERA_DEGRADED_THRESHOLD", "0"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.worker_pool_size, 50);
        assert_eq!(cfg.probe_method, ProbeMethod::Head);
        assert!(cfg.immutable_retention);
        assert_eq!(cfg.degraded_threshold, 1);
    }
}
