//! Database module.
//!
//! Provides SQLite storage with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub mod test_support {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::NamedTempFile;

    /// Open a store on a fresh temp file. Keep the file alive for the test.
    pub fn temp_store() -> (Store, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (store, tmp)
    }

    pub fn sample_endpoint(tenant: &str, name: &str) -> Endpoint {
        Endpoint {
            id: 0,
            tenant_id: tenant.to_string(),
            name: name.to_string(),
            url: "https://example.com/health".to_string(),
            interval_secs: 60,
            timeout_secs: 10,
            expected_status: 200,
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    pub fn sample_check(
        endpoint: &Endpoint,
        status: CheckStatus,
        at: DateTime<Utc>,
        latency_ms: Option<i64>,
    ) -> HealthCheckResult {
        HealthCheckResult {
            id: 0,
            endpoint_id: endpoint.id,
            tenant_id: endpoint.tenant_id.clone(),
            status,
            latency_ms,
            status_code: latency_ms.map(|_| 200),
            error_message: None,
            checked_at: at,
        }
    }
}
