//! Probe module for endpoint monitoring.
//!
//! A probe never fails from the caller's point of view: transport errors
//! and timeouts are folded into a `down` outcome.

mod http;

pub use http::*;

use crate::db::{CheckStatus, Endpoint};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest error text kept on a health check row.
const MAX_ERROR_LEN: usize = 200;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("request timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connect(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// HTTP method used for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Get,
    Head,
}

impl FromStr for ProbeMethod {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(ProbeMethod::Get),
            "HEAD" => Ok(ProbeMethod::Head),
            other => Err(ProbeError::Config(format!("unsupported probe method: {}", other))),
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMethod::Get => f.write_str("GET"),
            ProbeMethod::Head => f.write_str("HEAD"),
        }
    }
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub url: String,
    pub method: ProbeMethod,
    pub timeout: Duration,
    pub expected_status: u16,
    pub soft_latency: Duration,
}

impl ProbeConfig {
    pub fn for_endpoint(endpoint: &Endpoint, method: ProbeMethod, soft_latency_ms: u64) -> Self {
        Self {
            url: endpoint.url.clone(),
            method,
            timeout: Duration::from_secs(u64::from(endpoint.timeout_secs.max(1))),
            expected_status: endpoint.expected_status,
            soft_latency: Duration::from_millis(soft_latency_ms),
        }
    }
}

/// Classified result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub latency_ms: Option<i64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl ProbeOutcome {
    fn from_error(err: ProbeError) -> Self {
        let mut message = err.to_string();
        if message.len() > MAX_ERROR_LEN {
            let mut cut = MAX_ERROR_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self {
            status: CheckStatus::Down,
            latency_ms: None,
            status_code: None,
            error_message: Some(message),
        }
    }
}

/// Classify a received response.
///
/// `up` needs the expected status within the soft latency budget; any other
/// received response is `degraded`.
pub fn classify_response(response: &HttpResponse, config: &ProbeConfig) -> ProbeOutcome {
    let latency_ms = response.latency.as_millis() as i64;
    let (status, error_message) = if response.status_code != config.expected_status {
        (
            CheckStatus::Degraded,
            Some(format!(
                "unexpected status {} (expected {})",
                response.status_code, config.expected_status
            )),
        )
    } else if response.latency > config.soft_latency {
        (
            CheckStatus::Degraded,
            Some(format!(
                "slow response: {}ms exceeds {}ms",
                latency_ms,
                config.soft_latency.as_millis()
            )),
        )
    } else {
        (CheckStatus::Up, None)
    };

    ProbeOutcome {
        status,
        latency_ms: Some(latency_ms),
        status_code: Some(response.status_code),
        error_message,
    }
}

/// Run a probe with the given configuration.
pub async fn run_probe(client: &reqwest::Client, config: &ProbeConfig) -> ProbeOutcome {
    match run_http_probe(client, &config.url, config.method, config.timeout).await {
        Ok(response) => classify_response(&response, config),
        Err(e) => ProbeOutcome::from_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(expected_status: u16) -> ProbeConfig {
        ProbeConfig {
            url: String::new(),
            method: ProbeMethod::Get,
            timeout: Duration::from_secs(5),
            expected_status,
            soft_latency: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_classify_expected_status_is_up() {
        let resp = HttpResponse { status_code: 200, latency: Duration::from_millis(40) };
        let outcome = classify_response(&resp, &config(200));
        assert_eq!(outcome.status, CheckStatus::Up);
        assert_eq!(outcome.latency_ms, Some(40));
        assert_eq!(outcome.error_message, None);
    }

    #[test]
    fn test_classify_mismatch_and_slow_are_degraded() {
        let resp = HttpResponse { status_code: 503, latency: Duration::from_millis(40) };
        let outcome = classify_response(&resp, &config(200));
        assert_eq!(outcome.status, CheckStatus::Degraded);
        assert_eq!(outcome.status_code, Some(503));

        let slow = HttpResponse { status_code: 200, latency: Duration::from_millis(900) };
        assert_eq!(classify_response(&slow, &config(200)).status, CheckStatus::Degraded);
    }

    #[test]
    fn test_errors_are_down_without_latency() {
        let outcome = ProbeOutcome::from_error(ProbeError::Timeout(Duration::from_secs(3)));
        assert_eq!(outcome.status, CheckStatus::Down);
        assert_eq!(outcome.latency_ms, None);
        assert_eq!(outcome.status_code, None);

        let long = ProbeOutcome::from_error(ProbeError::Network("é".repeat(300)));
        assert!(long.error_message.unwrap().len() <= MAX_ERROR_LEN);
    }

    #[test]
    fn test_probe_method_parse() {
        assert_eq!("head".parse::<ProbeMethod>().unwrap(), ProbeMethod::Head);
        assert!("POST".parse::<ProbeMethod>().is_err());
    }
}
