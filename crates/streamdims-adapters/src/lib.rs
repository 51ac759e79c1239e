//! Metadata API contracts, the YouTube Data API adapter, quota-aware fetching and
//! record normalization.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use streamdims_storage::{ClassifyRetry, HttpError, HttpFetcher, RetryDisposition};
use thiserror::Error;

pub mod fetch;
pub mod normalize;
pub mod payload;
pub mod quota;

pub use fetch::{FetchCursor, FetchError, FetchSettings, QuotaAwareFetcher};
pub use normalize::{normalize, normalize_in_batches, Cancelled, NormalizedBatch};
pub use payload::{parse_item, parse_iso8601_duration, ChannelPayload, ParsedItem, VideoPayload};
pub use quota::{QuotaBudget, QuotaExceeded};

pub const CRATE_NAME: &str = "streamdims-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Platform limit for `maxResults` and for ids per lookup.
pub const MAX_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPageRequest {
    /// `None` requests the unfiltered chart.
    pub category_id: Option<String>,
    pub page_token: Option<String>,
    pub max_results: u32,
    pub region_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub items: Vec<JsonValue>,
    pub next_page_token: Option<String>,
}

impl ApiPage {
    /// Decode a list response. A body without an `items` array is a malformed page.
    pub fn from_json(body: JsonValue) -> Result<Self, ApiError> {
        let next_page_token = body
            .get("nextPageToken")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        match body {
            JsonValue::Object(mut map) => match map.remove("items") {
                Some(JsonValue::Array(items)) => Ok(Self {
                    items,
                    next_page_token,
                }),
                Some(_) => Err(ApiError::Transient("page `items` is not an array".into())),
                None => Err(ApiError::Transient("page has no `items` array".into())),
            },
            _ => Err(ApiError::Transient("page body is not a JSON object".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("request rejected: {0}")]
    BadRequest(String),
    #[error("platform quota exhausted: {0}")]
    QuotaExhausted(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ClassifyRetry for ApiError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            ApiError::Transient(_) => RetryDisposition::Retryable,
            ApiError::Auth(_) | ApiError::BadRequest(_) | ApiError::QuotaExhausted(_) => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

const QUOTA_REASONS: &[&str] = &["quotaExceeded", "dailyLimitExceeded"];
const RATE_REASONS: &[&str] = &["rateLimitExceeded", "userRateLimitExceeded"];

impl From<HttpError> for ApiError {
    fn from(err: HttpError) -> Self {
        let disposition = err.disposition();
        match err {
            HttpError::Status { status, url, body } => {
                let detail = format!("http {status} for {url}");
                match status {
                    403 if QUOTA_REASONS.iter().any(|r| body.contains(r)) => {
                        ApiError::QuotaExhausted(detail)
                    }
                    403 if RATE_REASONS.iter().any(|r| body.contains(r)) => {
                        ApiError::Transient(detail)
                    }
                    401 | 403 => ApiError::Auth(detail),
                    _ if disposition == RetryDisposition::Retryable => ApiError::Transient(detail),
                    _ => ApiError::BadRequest(detail),
                }
            }
            other if disposition == RetryDisposition::Retryable => {
                ApiError::Transient(other.to_string())
            }
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

/// The external metadata API, one call per page.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn list_videos(&self, request: &VideoPageRequest) -> Result<ApiPage, ApiError>;

    /// Look up at most [`MAX_PAGE_SIZE`] channels by id.
    async fn list_channels(&self, channel_ids: &[String]) -> Result<ApiPage, ApiError>;
}

#[derive(Clone, PartialEq, Eq)]
pub enum ApiCredential {
    /// Sent as the `key` query parameter.
    ApiKey(String),
    /// Sent as an `Authorization: Bearer` header.
    Bearer(String),
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiCredential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            ApiCredential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeDataApi {
    http: HttpFetcher,
    base_url: String,
    credential: ApiCredential,
}

impl YouTubeDataApi {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>, credential: ApiCredential) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential,
        }
    }

    async fn get(&self, resource: &str, mut query: Vec<(&str, String)>) -> Result<ApiPage, ApiError> {
        let url = format!("{}/{}", self.base_url, resource);
        let bearer = match &self.credential {
            ApiCredential::ApiKey(key) => {
                query.push(("key", key.clone()));
                None
            }
            ApiCredential::Bearer(token) => Some(token.as_str()),
        };
        let body = self.http.get_json(&url, &query, bearer).await?;
        ApiPage::from_json(body)
    }
}

#[async_trait]
impl MetadataApi for YouTubeDataApi {
    async fn list_videos(&self, request: &VideoPageRequest) -> Result<ApiPage, ApiError> {
        let mut query = vec![
            ("part", "snippet,contentDetails,statistics".to_string()),
            ("chart", "mostPopular".to_string()),
            ("regionCode", request.region_code.clone()),
            (
                "maxResults",
                request.max_results.clamp(1, MAX_PAGE_SIZE).to_string(),
            ),
        ];
        if let Some(category_id) = &request.category_id {
            query.push(("videoCategoryId", category_id.clone()));
        }
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.clone()));
        }
        self.get("videos", query).await
    }

    async fn list_channels(&self, channel_ids: &[String]) -> Result<ApiPage, ApiError> {
        if channel_ids.len() > MAX_PAGE_SIZE as usize {
            return Err(ApiError::BadRequest(format!(
                "{} channel ids exceed the lookup limit of {MAX_PAGE_SIZE}",
                channel_ids.len()
            )));
        }
        let query = vec![
            ("part", "snippet,statistics,topicDetails".to_string()),
            ("id", channel_ids.join(",")),
            ("maxResults", MAX_PAGE_SIZE.to_string()),
        ];
        self.get("channels", query).await
    }
}
