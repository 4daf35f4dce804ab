//! Uptime aggregation.
//!
//! Hourly summaries are rolled from raw health checks, daily from hourly
//! and monthly from daily. Each pass advances from the newest stored
//! summary through every period that has fully elapsed, and writes are
//! upserts, so re-running a period rewrites the same row.

use crate::db::{CheckStatus, DbError, Endpoint, Granularity, HealthCheckResult, Store, UptimeSummary};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Extra wait past a period's end, on top of the endpoint timeout, for
/// in-flight probes stamped inside the period to land.
const COMMIT_GRACE_SECS: i64 = 5;

/// `round(successful / total * 100, 2)`; no checks counts as full uptime.
pub fn uptime_percentage(successful: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    round2(successful as f64 / total as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Running counts over raw checks or finer summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Tally {
    pub total: i64,
    pub successful: i64,
    latency_sum: f64,
    latency_samples: i64,
    min_latency: Option<i64>,
    max_latency: Option<i64>,
}

impl Tally {
    pub fn add_check(&mut self, check: &HealthCheckResult) {
        self.total += 1;
        if check.status == CheckStatus::Up {
            self.successful += 1;
        }
        if let Some(latency) = check.latency_ms {
            self.latency_sum += latency as f64;
            self.latency_samples += 1;
            self.merge_range(Some(latency), Some(latency));
        }
    }

    pub fn add_summary(&mut self, summary: &UptimeSummary) {
        self.total += summary.total_checks;
        self.successful += summary.successful_checks;
        if let Some(avg) = summary.avg_latency_ms {
            self.latency_sum += avg * summary.latency_samples as f64;
            self.latency_samples += summary.latency_samples;
        }
        self.merge_range(summary.min_latency_ms, summary.max_latency_ms);
    }

    fn merge_range(&mut self, min: Option<i64>, max: Option<i64>) {
        self.min_latency = match (self.min_latency, min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency = match (self.max_latency, max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn uptime_percentage(&self) -> f64 {
        uptime_percentage(self.successful, self.total)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_samples == 0 {
            None
        } else {
            Some(round2(self.latency_sum / self.latency_samples as f64))
        }
    }

    fn into_summary(self, endpoint: &Endpoint, granularity: Granularity, period_start: DateTime<Utc>) -> UptimeSummary {
        UptimeSummary {
            endpoint_id: endpoint.id,
            tenant_id: endpoint.tenant_id.clone(),
            period_start,
            granularity,
            total_checks: self.total,
            successful_checks: self.successful,
            uptime_percentage: self.uptime_percentage(),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: self.min_latency,
            max_latency_ms: self.max_latency,
            latency_samples: self.latency_samples,
        }
    }
}

/// Uptime over a trailing window, stitched from summaries and raw checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUptime {
    pub endpoint_id: i64,
    pub hours: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub uptime_percentage: f64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    /// Part of the window answered from hourly summaries, `[start, end)`.
    pub summarized: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Background roller of uptime summaries.
pub struct UptimeAggregator {
    store: Arc<Store>,
    interval: Duration,
    persist_budget: Duration,
}

impl UptimeAggregator {
    pub fn new(store: Arc<Store>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            persist_budget: Duration::ZERO,
        }
    }

    /// Longest a check can spend in persistence retries. Periods stay open
    /// that much longer so late writes still land before summarizing.
    pub fn with_persist_budget(mut self, budget: Duration) -> Self {
        self.persist_budget = budget;
        self
    }

    /// Start the aggregation background task.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let written = this.run_once(Utc::now());
                if written > 0 {
                    tracing::debug!("UptimeAggregator: wrote {} summaries", written);
                }
            }
        });
    }

    /// One pass over every endpoint and granularity. Returns summaries written.
    pub fn run_once(&self, now: DateTime<Utc>) -> usize {
        let endpoints = match self.store.all_endpoints(false) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!("UptimeAggregator: Failed to get endpoints: {}", e);
                return 0;
            }
        };

        let mut written = 0;
        for endpoint in &endpoints {
            // Finer levels first so coarser ones see complete inputs.
            for granularity in Granularity::ALL {
                match self.catch_up(endpoint, granularity, now) {
                    Ok(n) => written += n,
                    Err(e) => {
                        tracing::error!(
                            endpoint_id = endpoint.id,
                            "UptimeAggregator: {} rollup failed: {}",
                            granularity,
                            e
                        );
                        break;
                    }
                }
            }
        }
        written
    }

    /// Summarize every complete period not yet stored for one level.
    fn catch_up(&self, endpoint: &Endpoint, granularity: Granularity, now: DateTime<Utc>) -> Result<usize, DbError> {
        let tenant = endpoint.tenant_id.as_str();
        let mut period_start = match self.store.last_summary_start(tenant, endpoint.id, granularity)? {
            Some(last) => granularity.next(last),
            None => {
                let earliest = match granularity.source() {
                    None => self.store.earliest_health_check_time(tenant, endpoint.id)?,
                    Some(source) => self.store.first_summary_start(tenant, endpoint.id, source)?,
                };
                match earliest {
                    Some(t) => granularity.truncate(t),
                    None => return Ok(0),
                }
            }
        };

        let settle_ms = (i64::from(endpoint.timeout_secs) + COMMIT_GRACE_SECS) * 1000
            + i64::try_from(self.persist_budget.as_millis()).unwrap_or(i64::MAX / 2);
        let cutoff = now - ChronoDuration::milliseconds(settle_ms);
        let mut summaries = Vec::new();
        loop {
            let period_end = granularity.next(period_start);
            if period_end > cutoff {
                break;
            }
            summaries.push(self.summarize(endpoint, granularity, period_start)?);
            period_start = period_end;
        }

        self.store.upsert_summaries(&summaries)?;
        if !summaries.is_empty() {
            tracing::debug!(
                endpoint_id = endpoint.id,
                "UptimeAggregator: {} {} summaries up to {}",
                summaries.len(),
                granularity,
                period_start
            );
        }
        Ok(summaries.len())
    }

    fn summarize(
        &self,
        endpoint: &Endpoint,
        granularity: Granularity,
        period_start: DateTime<Utc>,
    ) -> Result<UptimeSummary, DbError> {
        let period_end = granularity.next(period_start);
        let tenant = endpoint.tenant_id.as_str();
        let mut tally = Tally::default();

        match granularity.source() {
            None => {
                for check in self.store.health_checks_between(tenant, endpoint.id, period_start, period_end)? {
                    tally.add_check(&check);
                }
            }
            Some(source) => {
                for summary in self.store.get_summaries(tenant, endpoint.id, source, period_start, period_end)? {
                    tally.add_summary(&summary);
                }
            }
        }

        Ok(tally.into_summary(endpoint, granularity, period_start))
    }

    /// Recompute and upsert one period. Safe to repeat.
    pub fn aggregate_period(
        &self,
        endpoint: &Endpoint,
        granularity: Granularity,
        period_start: DateTime<Utc>,
    ) -> Result<UptimeSummary, DbError> {
        let summary = self.summarize(endpoint, granularity, granularity.truncate(period_start))?;
        self.store.upsert_summaries(std::slice::from_ref(&summary))?;
        Ok(summary)
    }

    /// Uptime over the trailing `hours` ending at `now`.
    ///
    /// Whole hours already summarized come from hourly summaries; the
    /// unaligned head and the unsummarized tail come from raw checks.
    pub fn uptime_over(
        &self,
        tenant_id: &str,
        endpoint_id: i64,
        hours: u32,
        now: DateTime<Utc>,
    ) -> Result<LiveUptime, DbError> {
        let window_start = now - ChronoDuration::hours(i64::from(hours));

        let mut first_hour = Granularity::Hourly.truncate(window_start);
        if first_hour < window_start {
            first_hour = Granularity::Hourly.next(first_hour);
        }
        let summarized_end = self
            .store
            .last_summary_start(tenant_id, endpoint_id, Granularity::Hourly)?
            .map(|last| Granularity::Hourly.next(last).min(Granularity::Hourly.truncate(now)))
            .filter(|end| *end > first_hour);

        let mut tally = Tally::default();
        let summarized = match summarized_end {
            Some(middle_end) => {
                for check in self.store.health_checks_between(tenant_id, endpoint_id, window_start, first_hour)? {
                    tally.add_check(&check);
                }
                for summary in
                    self.store
                        .get_summaries(tenant_id, endpoint_id, Granularity::Hourly, first_hour, middle_end)?
                {
                    tally.add_summary(&summary);
                }
                for check in self.store.health_checks_between(tenant_id, endpoint_id, middle_end, now)? {
                    tally.add_check(&check);
                }
                Some((first_hour, middle_end))
            }
            None => {
                for check in self.store.health_checks_between(tenant_id, endpoint_id, window_start, now)? {
                    tally.add_check(&check);
                }
                None
            }
        };

        Ok(LiveUptime {
            endpoint_id,
            hours,
            window_start,
            window_end: now,
            total_checks: tally.total,
            successful_checks: tally.successful,
            uptime_percentage: tally.uptime_percentage(),
            avg_latency_ms: tally.avg_latency_ms(),
            min_latency_ms: tally.min_latency,
            max_latency_ms: tally.max_latency,
            summarized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    fn setup() -> (Arc<Store>, UptimeAggregator, Endpoint, tempfile::NamedTempFile) {
        let (store, tmp) = temp_store();
        let store = Arc::new(store);
        let mut endpoint = sample_endpoint("acme", "api");
        store.add_endpoint(&mut endpoint).unwrap();
        let aggregator = UptimeAggregator::new(store.clone(), Duration::from_secs(60));
        (store, aggregator, endpoint, tmp)
    }

    fn insert(store: &Store, endpoint: &Endpoint, status: CheckStatus, time: DateTime<Utc>, latency: Option<i64>) {
        store
            .add_health_check(&mut sample_check(endpoint, status, time, latency))
            .unwrap();
    }

    #[test]
    fn test_uptime_percentage_rounding() {
        assert_eq!(uptime_percentage(0, 0), 100.0);
        assert_eq!(uptime_percentage(2, 3), 66.67);
        assert_eq!(uptime_percentage(1, 3), 33.33);
        assert_eq!(uptime_percentage(3, 3), 100.0);
    }

    #[test]
    fn test_empty_period_is_full_uptime() {
        let (_store, aggregator, endpoint, _tmp) = setup();
        let summary = aggregator.aggregate_period(&endpoint, Granularity::Hourly, at(5, 0)).unwrap();
        assert_eq!(summary.total_checks, 0);
        assert_eq!(summary.uptime_percentage, 100.0);
        assert_eq!(summary.avg_latency_ms, None);
    }

    #[test]
    fn test_hourly_summary_counts_and_latency() {
        let (store, aggregator, endpoint, _tmp) = setup();
        insert(&store, &endpoint, CheckStatus::Up, at(10, 0), Some(100));
        insert(&store, &endpoint, CheckStatus::Up, at(10, 15), Some(200));
        insert(&store, &endpoint, CheckStatus::Degraded, at(10, 30), Some(3000));
        insert(&store, &endpoint, CheckStatus::Down, at(10, 45), None);
        // Next hour; excluded.
        insert(&store, &endpoint, CheckStatus::Down, at(11, 0), None);

        let summary = aggregator.aggregate_period(&endpoint, Granularity::Hourly, at(10, 20)).unwrap();
        assert_eq!(summary.period_start, at(10, 0));
        assert_eq!(summary.total_checks, 4);
        assert_eq!(summary.successful_checks, 2);
        assert_eq!(summary.uptime_percentage, 50.0);
        assert_eq!(summary.avg_latency_ms, Some(1100.0));
        assert_eq!(summary.min_latency_ms, Some(100));
        assert_eq!(summary.max_latency_ms, Some(3000));
        assert_eq!(summary.latency_samples, 3);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let (store, aggregator, endpoint, _tmp) = setup();
        insert(&store, &endpoint, CheckStatus::Up, at(10, 0), Some(10));
        insert(&store, &endpoint, CheckStatus::Down, at(10, 5), None);
        insert(&store, &endpoint, CheckStatus::Up, at(10, 10), Some(30));

        aggregator.aggregate_period(&endpoint, Granularity::Hourly, at(10, 0)).unwrap();
        let before = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();
        aggregator.aggregate_period(&endpoint, Granularity::Hourly, at(10, 0)).unwrap();
        let after = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before, after);
        assert_eq!(after[0].uptime_percentage, 66.67);
    }

    #[test]
    fn test_daily_rolls_up_hourly_weighted() {
        let (store, aggregator, endpoint, _tmp) = setup();
        // Hour 1: one sample at 100ms. Hour 2: three samples at 200ms.
        insert(&store, &endpoint, CheckStatus::Up, at(1, 0), Some(100));
        insert(&store, &endpoint, CheckStatus::Up, at(2, 0), Some(200));
        insert(&store, &endpoint, CheckStatus::Up, at(2, 10), Some(200));
        insert(&store, &endpoint, CheckStatus::Up, at(2, 20), Some(200));
        insert(&store, &endpoint, CheckStatus::Down, at(2, 30), None);

        let written = aggregator.run_once(Utc.with_ymd_and_hms(2024, 3, 11, 1, 0, 0).unwrap());
        assert!(written > 0);

        let daily = store
            .get_summaries("acme", endpoint.id, Granularity::Daily, at(0, 0), at(23, 0))
            .unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].total_checks, 5);
        assert_eq!(daily[0].successful_checks, 4);
        assert_eq!(daily[0].uptime_percentage, 80.0);
        assert_eq!(daily[0].avg_latency_ms, Some(175.0));
        assert_eq!(daily[0].latency_samples, 4);

        // March is not over yet.
        let monthly = store
            .get_summaries("acme", endpoint.id, Granularity::Monthly, at(0, 0) - ChronoDuration::days(40), at(23, 0))
            .unwrap();
        assert!(monthly.is_empty());
    }

    #[test]
    fn test_run_once_skips_incomplete_periods() {
        let (store, aggregator, endpoint, _tmp) = setup();
        insert(&store, &endpoint, CheckStatus::Up, at(10, 0), Some(10));
        insert(&store, &endpoint, CheckStatus::Up, at(11, 5), Some(10));

        // 11:00 hour is still open at 11:30.
        aggregator.run_once(at(11, 30));
        let hourly = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].period_start, at(10, 0));

        // Second pass resumes after the stored hour.
        aggregator.run_once(at(12, 30));
        let hourly = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();
        assert_eq!(hourly.len(), 2);
    }

    #[test]
    fn test_persist_budget_delays_summarizing() {
        let (store, aggregator, endpoint, _tmp) = setup();
        let aggregator = aggregator.with_persist_budget(Duration::from_secs(120));
        insert(&store, &endpoint, CheckStatus::Up, at(10, 59), Some(10));

        // Past timeout and grace, but a retried write could still be pending.
        aggregator.run_once(at(11, 1));
        let hourly = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();
        assert!(hourly.is_empty());

        // A check stamped at 10:59 and persisted late is still counted.
        insert(&store, &endpoint, CheckStatus::Down, at(10, 59), None);
        aggregator.run_once(at(11, 3));
        let hourly = store
            .get_summaries("acme", endpoint.id, Granularity::Hourly, at(0, 0), at(23, 0))
            .unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].total_checks, 2);
        assert_eq!(hourly[0].successful_checks, 1);
    }

    #[test]
    fn test_live_uptime_matches_raw_computation() {
        let (store, aggregator, endpoint, _tmp) = setup();
        let now = at(12, 30);
        let statuses = [CheckStatus::Up, CheckStatus::Down, CheckStatus::Up, CheckStatus::Degraded];
        for i in 0..24 {
            let time = at(6, 45) + ChronoDuration::minutes(15 * i);
            insert(&store, &endpoint, statuses[i as usize % 4], time, Some(10 + i));
        }

        let raw_only = aggregator.uptime_over("acme", endpoint.id, 5, now).unwrap();
        assert!(raw_only.summarized.is_none());

        // Summaries only up to 10:00; the rest must come from raw.
        aggregator.run_once(at(10, 0) + ChronoDuration::seconds(30));
        let split = aggregator.uptime_over("acme", endpoint.id, 5, now).unwrap();

        assert_eq!(split.summarized, Some((at(8, 0), at(10, 0))));
        assert_eq!(split.total_checks, raw_only.total_checks);
        assert_eq!(split.successful_checks, raw_only.successful_checks);
        assert_eq!(split.uptime_percentage, raw_only.uptime_percentage);
        assert_eq!(split.min_latency_ms, raw_only.min_latency_ms);
        assert_eq!(split.max_latency_ms, raw_only.max_latency_ms);
    }

    #[test]
    fn test_live_uptime_without_checks() {
        let (_store, aggregator, endpoint, _tmp) = setup();
        let live = aggregator.uptime_over("acme", endpoint.id, 24, at(12, 0)).unwrap();
        assert_eq!(live.total_checks, 0);
        assert_eq!(live.uptime_percentage, 100.0);
    }
}
