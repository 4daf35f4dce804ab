//! ClickHouse HTTP interface backend for OpenTelemetry tables.

use super::{BackendError, LogBackend, LogRecord, Span, TraceBackend};

use async_trait::async_trait;
use chrono::DateTime;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const SPANS_QUERY: &str = "\
SELECT SpanId, ParentSpanId, SpanName, ServiceName,
       toUnixTimestamp64Nano(Timestamp) AS StartTimeUnixNano,
       Duration AS DurationNano, StatusCode
FROM otel_traces
WHERE TraceId = {trace_id:String}
  AND ResourceAttributes['tenant_id'] = {tenant_id:String}
ORDER BY StartTimeUnixNano ASC
FORMAT JSONEachRow";

const LOGS_QUERY: &str = "\
SELECT toUnixTimestamp64Nano(Timestamp) AS TimestampUnixNano,
       SeverityText, ServiceName, Body, TraceId, SpanId, LogAttributes
FROM otel_logs
WHERE ResourceAttributes['tenant_id'] = {tenant_id:String}
  AND (TraceId = {trace_id:String}
       OR LogAttributes['trace_id'] = {trace_id:String}
       OR position(Body, {trace_id:String}) > 0)
ORDER BY Timestamp ASC
LIMIT {limit:UInt32}
FORMAT JSONEachRow";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpanRow {
    span_id: String,
    #[serde(default)]
    parent_span_id: String,
    span_name: String,
    service_name: String,
    start_time_unix_nano: i64,
    duration_nano: i64,
    #[serde(default)]
    status_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LogRow {
    timestamp_unix_nano: i64,
    #[serde(default)]
    severity_text: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    trace_id: String,
    #[serde(default)]
    span_id: String,
    #[serde(default)]
    log_attributes: BTreeMap<String, String>,
}

/// Client for ClickHouse's HTTP interface.
#[derive(Clone)]
pub struct ClickHouseClient {
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
}

impl ClickHouseClient {
    pub fn new(url: &str, user: &str, password: &str, timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Http(e.to_string()))?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    /// Run a parameterized query and decode `JSONEachRow` output.
    async fn query<T: DeserializeOwned>(&self, sql: &str, params: &[(&str, &str)]) -> Result<Vec<T>, BackendError> {
        let mut query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (format!("param_{}", k), v.to_string()))
            .collect();
        query.push(("output_format_json_quote_64bit_integers".to_string(), "0".to_string()));

        let response = self
            .http
            .post(format!("{}/", self.url))
            .query(&query)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| BackendError::Decode(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl TraceBackend for ClickHouseClient {
    async fn spans(&self, tenant_id: &str, trace_id: &str) -> Result<Vec<Span>, BackendError> {
        let rows: Vec<SpanRow> = self
            .query(SPANS_QUERY, &[("trace_id", trace_id), ("tenant_id", tenant_id)])
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| Span {
                span_id: r.span_id,
                parent_span_id: r.parent_span_id,
                name: r.span_name,
                service_name: r.service_name,
                start_unix_nano: r.start_time_unix_nano,
                duration_nano: r.duration_nano,
                status_code: r.status_code,
            })
            .collect())
    }
}

#[async_trait]
impl LogBackend for ClickHouseClient {
    async fn logs(&self, tenant_id: &str, trace_id: &str, limit: usize) -> Result<Vec<LogRecord>, BackendError> {
        let limit = limit.min(u32::MAX as usize).to_string();
        let rows: Vec<LogRow> = self
            .query(
                LOGS_QUERY,
                &[("trace_id", trace_id), ("tenant_id", tenant_id), ("limit", &limit)],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| LogRecord {
                timestamp: DateTime::from_timestamp_nanos(r.timestamp_unix_nano),
                level: r.severity_text,
                service_name: r.service_name,
                message: r.body,
                trace_id: r.trace_id,
                span_id: r.span_id,
                labels: r.log_attributes,
            })
            .collect())
    }
}
