//! Trace/log correlation.
//!
//! Spans form a forest, not a general graph: each span has at most one
//! parent within the result set. The forest is kept in an arena (the span
//! vector) with index links, so no node owns another.

use super::{BackendError, LogBackend, LogRecord, Span, TraceBackend};

use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Most log records returned for one trace.
pub const MAX_CORRELATED_LOGS: usize = 1000;

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("invalid trace id: {0}")]
    InvalidTraceId(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn trace_id_pattern() -> &'static Regex {
    static TRACE_ID: OnceLock<Regex> = OnceLock::new();
    TRACE_ID.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{16,32}$").expect("static trace id pattern"))
}

/// Accept 16-32 hex characters; stores keep ids in lowercase.
pub fn normalize_trace_id(raw: &str) -> Result<String, CorrelateError> {
    let trimmed = raw.trim();
    if trace_id_pattern().is_match(trimmed) {
        Ok(trimmed.to_ascii_lowercase())
    } else {
        Err(CorrelateError::InvalidTraceId(raw.chars().take(64).collect()))
    }
}

/// A span with its position in the forest.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    #[serde(flatten)]
    pub span: Span,
    pub index: usize,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub depth: usize,
}

/// Arena-backed span forest ordered by start time.
#[derive(Debug, Clone, Serialize)]
pub struct SpanForest {
    pub roots: Vec<usize>,
    pub nodes: Vec<SpanNode>,
}

impl SpanForest {
    /// Link spans to parents found in the same set. Spans whose parent is
    /// empty, missing or themselves become roots. A parent cycle is cut at
    /// the earliest span on the cycle; spans hanging off it keep their parent.
    pub fn build(mut spans: Vec<Span>) -> Self {
        spans.sort_by(|a, b| {
            a.start_unix_nano
                .cmp(&b.start_unix_nano)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });

        let mut by_id: HashMap<&str, usize> = HashMap::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            by_id.entry(span.span_id.as_str()).or_insert(i);
        }

        let mut parent: Vec<Option<usize>> = spans
            .iter()
            .enumerate()
            .map(|(i, span)| {
                if span.parent_span_id.is_empty() {
                    return None;
                }
                by_id.get(span.parent_span_id.as_str()).copied().filter(|&p| p != i)
            })
            .collect();

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); spans.len()];
        for (i, p) in parent.iter().enumerate() {
            if let Some(p) = p {
                children[*p].push(i);
            }
        }

        let mut depth = vec![0usize; spans.len()];
        let mut visited = vec![false; spans.len()];
        let mut roots: Vec<usize> = (0..spans.len()).filter(|&i| parent[i].is_none()).collect();

        for &root in &roots {
            walk(root, &children, &mut visited, &mut depth);
        }

        // Anything unreached sits on or below a parent cycle.
        while let Some(unreached) = (0..spans.len()).find(|&i| !visited[i]) {
            let cut = cycle_member(unreached, &parent);
            if let Some(p) = parent[cut].take() {
                children[p].retain(|&c| c != cut);
            }
            roots.push(cut);
            walk(cut, &children, &mut visited, &mut depth);
        }
        roots.sort_unstable();

        let nodes = spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| SpanNode {
                span,
                index: i,
                parent: parent[i],
                children: std::mem::take(&mut children[i]),
                depth: depth[i],
            })
            .collect();

        Self { roots, nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `max(span end) - min(span start)`, or 0 for an empty forest.
    pub fn duration_nano(&self) -> i64 {
        let start = self.nodes.iter().map(|n| n.span.start_unix_nano).min();
        let end = self.nodes.iter().map(|n| n.span.end_unix_nano()).max();
        match (start, end) {
            (Some(s), Some(e)) => e.saturating_sub(s).max(0),
            _ => 0,
        }
    }
}

/// Earliest span on the parent cycle above `start`.
fn cycle_member(start: usize, parent: &[Option<usize>]) -> usize {
    let mut seen_at: Vec<Option<usize>> = vec![None; parent.len()];
    let mut chain = Vec::new();
    let mut node = start;
    loop {
        if let Some(at) = seen_at[node] {
            return chain[at..].iter().copied().min().unwrap_or(node);
        }
        seen_at[node] = Some(chain.len());
        chain.push(node);
        match parent[node] {
            Some(p) => node = p,
            None => return node,
        }
    }
}

/// Breadth-first depth assignment from `start`.
fn walk(start: usize, children: &[Vec<usize>], visited: &mut [bool], depth: &mut [usize]) {
    let mut queue = VecDeque::from([(start, 0usize)]);
    while let Some((node, d)) = queue.pop_front() {
        if visited[node] {
            continue;
        }
        visited[node] = true;
        depth[node] = d;
        for &child in &children[node] {
            queue.push_back((child, d + 1));
        }
    }
}

/// Trace half of a correlation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TraceLookup {
    Found {
        span_count: usize,
        duration_nano: i64,
        duration_ms: f64,
        services: Vec<String>,
        #[serde(flatten)]
        forest: SpanForest,
    },
    /// Trace store has no spans yet or any more.
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationResult {
    pub trace_id: String,
    pub trace: TraceLookup,
    pub log_count: usize,
    pub logs: Vec<LogRecord>,
    /// More than `MAX_CORRELATED_LOGS` records matched; only the oldest are returned.
    pub truncated: bool,
}

/// Joins a trace id across the trace and log stores.
pub struct Correlator {
    traces: Arc<dyn TraceBackend>,
    logs: Arc<dyn LogBackend>,
}

impl Correlator {
    pub fn new(traces: Arc<dyn TraceBackend>, logs: Arc<dyn LogBackend>) -> Self {
        Self { traces, logs }
    }

    pub async fn correlate(&self, trace_id: &str, tenant_id: &str) -> Result<CorrelationResult, CorrelateError> {
        let trace_id = normalize_trace_id(trace_id)?;

        let (spans, logs) = tokio::join!(
            self.traces.spans(tenant_id, &trace_id),
            self.logs.logs(tenant_id, &trace_id, MAX_CORRELATED_LOGS + 1)
        );
        let spans = spans?;
        let mut logs = logs?;
        let truncated = logs.len() > MAX_CORRELATED_LOGS;
        logs.truncate(MAX_CORRELATED_LOGS);

        tracing::debug!(
            tenant = %tenant_id,
            trace_id = %trace_id,
            spans = spans.len(),
            logs = logs.len(),
            "Correlated trace"
        );

        let trace = if spans.is_empty() {
            TraceLookup::NotFound
        } else {
            let forest = SpanForest::build(spans);
            let mut services: Vec<String> = forest.nodes.iter().map(|n| n.span.service_name.clone()).collect();
            services.sort();
            services.dedup();
            let duration_nano = forest.duration_nano();
            TraceLookup::Found {
                span_count: forest.len(),
                duration_nano,
                duration_ms: duration_nano as f64 / 1_000_000.0,
                services,
                forest,
            }
        };

        Ok(CorrelationResult {
            trace_id,
            trace,
            log_count: logs.len(),
            logs,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::BTreeMap;

    const TRACE: &str = "4BF92F3577B34DA6A3CE929D0E0E4736";

    struct FakeTraces(Vec<Span>);
    struct FakeLogs(Vec<LogRecord>);
    struct BrokenTraces;

    #[async_trait]
    impl TraceBackend for FakeTraces {
        async fn spans(&self, _tenant_id: &str, _trace_id: &str) -> Result<Vec<Span>, BackendError> {
            Ok(self.0.clone())
        }
    }

    #[async_trait]
    impl LogBackend for FakeLogs {
        async fn logs(&self, _tenant_id: &str, _trace_id: &str, limit: usize) -> Result<Vec<LogRecord>, BackendError> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    #[async_trait]
    impl TraceBackend for BrokenTraces {
        async fn spans(&self, _tenant_id: &str, _trace_id: &str) -> Result<Vec<Span>, BackendError> {
            Err(BackendError::Timeout)
        }
    }

    fn span(id: &str, parent: &str, start: i64, duration: i64) -> Span {
        Span {
            span_id: id.to_string(),
            parent_span_id: parent.to_string(),
            name: format!("op-{}", id),
            service_name: "api".to_string(),
            start_unix_nano: start,
            duration_nano: duration,
            status_code: "Ok".to_string(),
        }
    }

    fn log(message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level: "INFO".to_string(),
            service_name: "api".to_string(),
            message: message.to_string(),
            trace_id: TRACE.to_ascii_lowercase(),
            span_id: String::new(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_trace_id_validation() {
        assert_eq!(normalize_trace_id(TRACE).unwrap(), TRACE.to_ascii_lowercase());
        assert!(normalize_trace_id("abc").is_err());
        assert!(normalize_trace_id("zzzzzzzzzzzzzzzzzz").is_err());
        assert!(normalize_trace_id(&"a".repeat(33)).is_err());
        assert!(normalize_trace_id("00f067aa0ba902b7").is_ok());
    }

    #[test]
    fn test_parent_child() {
        // B arrives first in the result set; linking must not depend on order.
        let forest = SpanForest::build(vec![span("B", "A", 150, 300), span("A", "", 100, 200)]);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest.roots, vec![0]);
        assert_eq!(forest.nodes[0].span.span_id, "A");
        assert_eq!(forest.nodes[0].children, vec![1]);
        assert_eq!(forest.nodes[1].parent, Some(0));
        assert_eq!(forest.nodes[1].depth, 1);
        assert_eq!(forest.duration_nano(), 350);
    }

    #[test]
    fn test_missing_parent_and_multiple_roots() {
        let forest = SpanForest::build(vec![
            span("A", "", 0, 10),
            span("C", "gone", 5, 10),
            span("D", "", 7, 10),
            span("E", "C", 8, 1),
        ]);
        assert_eq!(forest.len(), 4);
        assert_eq!(forest.roots.len(), 3);
        let c = forest.nodes.iter().find(|n| n.span.span_id == "C").unwrap();
        assert!(c.parent.is_none());
        assert_eq!(c.children.len(), 1);
    }

    #[test]
    fn test_self_parent_and_cycle_are_roots() {
        let forest = SpanForest::build(vec![
            span("S", "S", 0, 1),
            span("X", "Y", 1, 1),
            span("Y", "X", 2, 1),
        ]);
        assert_eq!(forest.len(), 3);
        // S roots itself; the X/Y cycle is cut at X, the earlier span.
        assert_eq!(forest.roots, vec![0, 1]);
        assert_eq!(forest.nodes[2].parent, Some(1));
        assert_eq!(forest.nodes[2].depth, 1);
        assert!(forest.nodes[1].parent.is_none());
    }

    #[test]
    fn test_cycle_cut_keeps_descendant_parent() {
        // D hangs off the X/Y cycle but starts before both.
        let forest = SpanForest::build(vec![
            span("D", "X", 0, 1),
            span("X", "Y", 5, 1),
            span("Y", "X", 6, 1),
        ]);
        assert_eq!(forest.roots, vec![1]);
        assert_eq!(forest.nodes[0].span.span_id, "D");
        assert_eq!(forest.nodes[0].parent, Some(1));
        assert_eq!(forest.nodes[0].depth, 1);
        assert_eq!(forest.nodes[2].parent, Some(1));
        assert!(forest.nodes[1].parent.is_none());
        assert_eq!(forest.nodes[1].children, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_log_overflow_is_flagged() {
        let logs: Vec<LogRecord> = (0..MAX_CORRELATED_LOGS + 5).map(|i| log(&format!("line {}", i))).collect();
        let correlator = Correlator::new(Arc::new(FakeTraces(vec![])), Arc::new(FakeLogs(logs)));

        let result = correlator.correlate(TRACE, "acme").await.unwrap();
        assert!(result.truncated);
        assert_eq!(result.log_count, MAX_CORRELATED_LOGS);
        assert_eq!(result.logs[0].message, "line 0");

        let exact: Vec<LogRecord> = (0..MAX_CORRELATED_LOGS).map(|i| log(&format!("line {}", i))).collect();
        let correlator = Correlator::new(Arc::new(FakeTraces(vec![])), Arc::new(FakeLogs(exact)));
        assert!(!correlator.correlate(TRACE, "acme").await.unwrap().truncated);
    }

    #[tokio::test]
    async fn test_correlate_joins_spans_and_logs() {
        let correlator = Correlator::new(
            Arc::new(FakeTraces(vec![span("A", "", 1_000_000, 4_000_000), span("B", "A", 2_000_000, 1_000_000)])),
            Arc::new(FakeLogs(vec![log("start"), log("done")])),
        );

        let result = correlator.correlate(TRACE, "acme").await.unwrap();
        assert_eq!(result.trace_id, TRACE.to_ascii_lowercase());
        assert_eq!(result.log_count, 2);
        match result.trace {
            TraceLookup::Found {
                span_count,
                duration_ms,
                forest,
                ..
            } => {
                assert_eq!(span_count, 2);
                assert_eq!(duration_ms, 4.0);
                assert_eq!(forest.roots.len(), 1);
            }
            TraceLookup::NotFound => panic!("expected spans"),
        }
    }

    #[tokio::test]
    async fn test_empty_trace_still_returns_logs() {
        let correlator = Correlator::new(Arc::new(FakeTraces(vec![])), Arc::new(FakeLogs(vec![log("orphan")])));
        let result = correlator.correlate(TRACE, "acme").await.unwrap();
        assert!(matches!(result.trace, TraceLookup::NotFound));
        assert_eq!(result.logs.len(), 1);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["trace"]["status"], "not_found");
    }

    #[tokio::test]
    async fn test_backend_failure_and_bad_id() {
        let correlator = Correlator::new(Arc::new(BrokenTraces), Arc::new(FakeLogs(vec![])));
        assert!(matches!(
            correlator.correlate(TRACE, "acme").await,
            Err(CorrelateError::Backend(BackendError::Timeout))
        ));
        assert!(matches!(
            correlator.correlate("not-a-trace", "acme").await,
            Err(CorrelateError::InvalidTraceId(_))
        ));
    }
}
