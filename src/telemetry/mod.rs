//! Trace and log lookup for correlation.
//!
//! Both stores sit behind small async traits so the correlator can run
//! against ClickHouse in production and against in-memory fakes in tests.

mod clickhouse;
mod correlate;

pub use clickhouse::*;
pub use correlate::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure talking to a trace or log store.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request timed out")]
    Timeout,
    #[error("backend request failed: {0}")]
    Http(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend response: {0}")]
    Decode(String),
}

/// One span as returned by the trace store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub span_id: String,
    /// Empty for root spans.
    pub parent_span_id: String,
    pub name: String,
    pub service_name: String,
    pub start_unix_nano: i64,
    pub duration_nano: i64,
    pub status_code: String,
}

impl Span {
    pub fn end_unix_nano(&self) -> i64 {
        self.start_unix_nano.saturating_add(self.duration_nano.max(0))
    }
}

/// One log record referencing a trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub service_name: String,
    pub message: String,
    pub trace_id: String,
    pub span_id: String,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// All spans of a trace owned by `tenant_id`, in any order.
    async fn spans(&self, tenant_id: &str, trace_id: &str) -> Result<Vec<Span>, BackendError>;
}

#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Up to `limit` log records of `tenant_id` carrying `trace_id` in a
    /// trace column, a label or the message body, oldest first.
    async fn logs(&self, tenant_id: &str, trace_id: &str, limit: usize) -> Result<Vec<LogRecord>, BackendError>;
}
