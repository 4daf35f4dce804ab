//! Retention manager for pruning raw health checks.
//!
//! Only raw checks expire. Summaries and outages are kept.

use crate::db::{DbError, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting raw data past its retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    /// Start the retention manager background task.
    pub fn start(self: &Arc<Self>) {
        if self.retention_days == 0 {
            tracing::info!("RetentionManager: raw retention disabled");
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = this.run_once(Utc::now()) {
                    tracing::error!("RetentionManager: Failed to prune health checks: {}", e);
                }
            }
        });
    }

    /// Delete raw checks older than the retention window. Returns rows removed.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let cutoff = now - ChronoDuration::days(i64::from(self.retention_days));
        let deleted = self.store.delete_health_checks_before(cutoff)?;
        if deleted > 0 {
            tracing::info!("RetentionManager: pruned {} health checks before {}", deleted, cutoff);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::{CheckStatus, Granularity};
    use crate::scheduler::UptimeAggregator;
    use chrono::TimeZone;

    #[test]
    fn test_prunes_only_old_raw_checks() {
        let (store, _tmp) = temp_store();
        let store = Arc::new(store);
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let old = now - ChronoDuration::days(45);
        let recent = now - ChronoDuration::days(2);
        store
            .add_health_check(&mut sample_check(&endpoint, CheckStatus::Up, old, Some(10)))
            .unwrap();
        store
            .add_health_check(&mut sample_check(&endpoint, CheckStatus::Up, recent, Some(10)))
            .unwrap();

        let aggregator = UptimeAggregator::new(store.clone(), Duration::from_secs(60));
        aggregator.aggregate_period(&endpoint, Granularity::Hourly, old).unwrap();

        let retention = RetentionManager::new(store.clone(), 30);
        assert_eq!(retention.run_once(now).unwrap(), 1);
        assert_eq!(retention.run_once(now).unwrap(), 0);

        let remaining = store.recent_health_checks("acme", endpoint.id, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].checked_at, recent);

        let summaries = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, old - ChronoDuration::hours(1), now)
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].total_checks, 1);
    }
}
