//! HTTP probe implementation.

use super::{ProbeError, ProbeMethod};
use std::time::{Duration, Instant};

/// Status and time-to-headers of a received response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub latency: Duration,
}

/// Build the client shared by all probes.
pub fn build_client() -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .user_agent(concat!("obsera-monitor/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))
}

/// Run an HTTP probe against the given URL.
///
/// The timeout is a hard budget over the whole request, not just connect.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    method: ProbeMethod,
    timeout: Duration,
) -> Result<HttpResponse, ProbeError> {
    let request = match method {
        ProbeMethod::Get => client.get(url),
        ProbeMethod::Head => client.head(url),
    };

    let start = Instant::now();

    let response = tokio::time::timeout(timeout, request.timeout(timeout).send())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if e.is_connect() {
                ProbeError::Connect(e.to_string())
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    Ok(HttpResponse {
        status_code: response.status().as_u16(),
        latency: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_probe_reports_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let client = build_client().unwrap();
        let url = format!("{}/health", server.url());
        let resp = run_http_probe(&client, &url, ProbeMethod::Get, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(resp.status_code, 503);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_probe_head() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("HEAD", "/").with_status(200).create_async().await;

        let client = build_client().unwrap();
        let resp = run_http_probe(&client, &server.url(), ProbeMethod::Head, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(resp.status_code, 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let client = build_client().unwrap();
        let result = run_http_probe(
            &client,
            "http://127.0.0.1:1/",
            ProbeMethod::Get,
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(
            result,
            Err(ProbeError::Connect(_)) | Err(ProbeError::Network(_))
        ));
    }
}
