//! Database model types.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A tenant-configured URL monitored periodically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub url: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub expected_status: u16,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Degraded,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Degraded => "degraded",
            CheckStatus::Down => "down",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, CheckStatus::Up)
    }
}

/// One probe attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub id: i64,
    pub endpoint_id: i64,
    pub tenant_id: String,
    pub status: CheckStatus,
    /// None on timeout or connection failure.
    pub latency_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutageStatus {
    Ongoing,
    Resolved,
}

impl OutageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutageStatus::Ongoing => "ongoing",
            OutageStatus::Resolved => "resolved",
        }
    }
}

/// A contiguous unhealthy period of an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outage {
    pub id: i64,
    pub endpoint_id: i64,
    pub tenant_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub failure_count: i64,
    pub status: OutageStatus,
    pub root_cause: Option<String>,
}

/// Summary period size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Hourly, Granularity::Daily, Granularity::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }

    /// The granularity this one is rolled up from, or None for raw checks.
    pub fn source(&self) -> Option<Granularity> {
        match self {
            Granularity::Hourly => None,
            Granularity::Daily => Some(Granularity::Hourly),
            Granularity::Monthly => Some(Granularity::Daily),
        }
    }

    /// Start of the period containing `dt`.
    pub fn truncate(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let (year, month, day, hour) = match self {
            Granularity::Hourly => {
                let ts = dt.timestamp();
                return DateTime::from_timestamp(ts - ts.rem_euclid(3600), 0).unwrap_or(dt);
            }
            Granularity::Daily => (dt.year(), dt.month(), dt.day(), 0),
            Granularity::Monthly => (dt.year(), dt.month(), 1, 0),
        };
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .unwrap_or(dt)
    }

    /// Start of the period following the one starting at `start`.
    pub fn next(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Granularity::Hourly => start + ChronoDuration::hours(1),
            Granularity::Daily => start + ChronoDuration::days(1),
            Granularity::Monthly => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(start + ChronoDuration::days(31))
            }
        }
    }
}

/// Precomputed uptime for one endpoint and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeSummary {
    pub endpoint_id: i64,
    pub tenant_id: String,
    pub period_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub uptime_percentage: f64,
    pub avg_latency_ms: Option<f64>,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    /// Number of non-null latencies behind `avg_latency_ms`, kept so
    /// coarser rollups can weight averages exactly.
    pub latency_samples: i64,
}

/// A tenant's public status page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusPage {
    pub id: i64,
    pub tenant_id: String,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub is_public: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    /// Ordered endpoint references.
    pub endpoint_ids: Vec<i64>,
}

#[derive(Debug, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl FromStr for CheckStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(CheckStatus::Up),
            "degraded" => Ok(CheckStatus::Degraded),
            "down" => Ok(CheckStatus::Down),
            other => Err(UnknownVariant { kind: "check status", value: other.to_string() }),
        }
    }
}

impl FromStr for OutageStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(OutageStatus::Ongoing),
            "resolved" => Ok(OutageStatus::Resolved),
            other => Err(UnknownVariant { kind: "outage status", value: other.to_string() }),
        }
    }
}

impl FromStr for Granularity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Granularity::Hourly),
            "daily" => Ok(Granularity::Daily),
            "monthly" => Ok(Granularity::Monthly),
            other => Err(UnknownVariant { kind: "granularity", value: other.to_string() }),
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn text_column<T>(value: ValueRef<'_>) -> FromSqlResult<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    value
        .as_str()?
        .parse()
        .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
}

impl ToSql for CheckStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CheckStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        text_column(value)
    }
}

impl ToSql for OutageStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutageStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        text_column(value)
    }
}

impl ToSql for Granularity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Granularity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        text_column(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 15, 12, 34, 56).unwrap();
        assert_eq!(
            Granularity::Hourly.truncate(dt),
            Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Daily.truncate(dt),
            Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Granularity::Monthly.truncate(dt),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_next_month_wraps_year() {
        let dec = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(
            Granularity::Monthly.next(dec),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        );
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        assert_eq!((Granularity::Monthly.next(feb) - feb).num_days(), 29);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("degraded".parse::<CheckStatus>().unwrap(), CheckStatus::Degraded);
        assert!("sideways".parse::<CheckStatus>().is_err());
        assert!(CheckStatus::Down.is_failure());
        assert!(!CheckStatus::Up.is_failure());
    }
}
