// src/fetch/http.rs

use anyhow::{Context, Result};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::HttpConfig;

/// Statuses worth another attempt.
pub const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub backoff_factor: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `factor * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff_factor * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: StatusCode },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => TRANSIENT_STATUSES.contains(&status.as_u16()),
            FetchError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
        }
    }
}

/// HTTP handle owned by the fetch stage. Only idempotent GETs go through it,
/// so every transient failure may be retried.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(cfg: &HttpConfig, policy: RetryPolicy) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&cfg.user_agent).context("invalid user agent")?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .danger_accept_invalid_certs(cfg.accept_invalid_certs)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client, policy })
    }

    pub fn from_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    async fn get_once(&self, url: &str) -> Result<Response, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(FetchError::Status {
                url: url.to_string(),
                status,
            })
        }
    }

    /// GET with retry on transient failures. Non-transient failures return at once.
    pub async fn get(&self, url: &str) -> Result<Response, FetchError> {
        let mut attempts = 0;
        loop {
            debug!(%url, attempt = attempts + 1, "GET");
            match self.get_once(url).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempts < self.policy.max_retries => {
                    attempts += 1;
                    let delay = self.policy.delay_for(attempts);
                    warn!(%url, attempt = attempts, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(%url, attempts = attempts + 1, error = %e, "GET failed");
                    return Err(e);
                }
            }
        }
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.get(url).await?;
        resp.text()
            .await
            .with_context(|| format!("reading body from {}", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(max_retries: u32) -> HttpClient {
        HttpClient::from_client(
            Client::new(),
            RetryPolicy {
                max_retries,
                backoff_factor: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff_factor: Duration::from_secs(1),
        };
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/listing/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/listing/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let client = fast_client(3);
        let body = client
            .get_text(&format!("{}/listing/", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, "ok");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = fast_client(3);
        let err = client
            .get(&format!("{}/missing.zip", server.uri()))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = fast_client(2);
        let err = client.get(&format!("{}/x", server.uri())).await.unwrap_err();
        match err {
            FetchError::Status { status, .. } => assert_eq!(status.as_u16(), 502),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }
}
