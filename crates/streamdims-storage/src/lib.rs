//! Snapshot storage + HTTP transport utilities for StreamDims.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

mod dataset;
mod tables;

pub use dataset::{
    DatasetStore, ManifestFile, PublishedSnapshot, SnapshotKind, SnapshotManifest, StagedSnapshot,
    StoreError, STALE_STAGING_AGE,
};

pub const CRATE_NAME: &str = "streamdims-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors that know whether trying again could help.
pub trait ClassifyRetry {
    fn disposition(&self) -> RetryDisposition;

    fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff: `max_attempts` tries in total, the delay doubling
/// from `base_delay` up to `max_delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// `op` receives the zero-based attempt index. The error of the final attempt
    /// is returned unchanged, so callers can tell exhaustion (still retryable) from
    /// a fatal failure.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyRetry + std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("undecodable json body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClassifyRetry for HttpError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            HttpError::Request { source, .. } => classify_reqwest_error(source),
            HttpError::Status { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            HttpError::Decode { .. } => RetryDisposition::Retryable,
        }
    }
}

/// Single-attempt JSON GET client. Every request carries the configured timeout and
/// holds one of `max_in_flight` permits while it runs; retrying is the caller's call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<JsonValue, HttpError> {
        // The semaphore lives as long as self and is never closed.
        let _permit = self.in_flight.acquire().await.ok();
        let span = info_span!("http_fetch", url);

        async {
            let mut request = self.client.get(url).query(query);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            let resp = request.send().await.map_err(|source| HttpError::Request {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await.map_err(|source| HttpError::Request {
                url: final_url.clone(),
                source,
            })?;

            if !status.is_success() {
                return Err(HttpError::Status {
                    status: status.as_u16(),
                    url: final_url,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            serde_json::from_slice(&body).map_err(|source| HttpError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}
