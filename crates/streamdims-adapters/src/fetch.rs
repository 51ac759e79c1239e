//! Quota-aware, resumable pagination over the metadata API.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use streamdims_core::{CancelSignal, ItemKind, RawItem, ResumePoint};
use streamdims_storage::{ClassifyRetry, RetryDisposition, RetryPolicy};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::payload::payload_id;
use crate::quota::{QuotaBudget, QuotaExceeded};
use crate::{ApiError, ApiPage, MetadataApi, VideoPageRequest, MAX_PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Quota units charged for every request, retries included.
    pub page_cost: u64,
    pub page_size: u32,
    pub region_code: String,
    pub retry: RetryPolicy,
    /// Upper bound on concurrent channel lookups.
    pub max_in_flight: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_cost: 1,
            page_size: MAX_PAGE_SIZE,
            region_code: "US".to_string(),
            retry: RetryPolicy::default(),
            max_in_flight: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{reason}")]
    QuotaExceeded {
        reason: String,
        resume: ResumePoint,
    },
    #[error("fetch failed after {attempts} attempts: {message}")]
    Exhausted {
        attempts: u32,
        message: String,
        resume: ResumePoint,
    },
    #[error("fetch cancelled")]
    Cancelled { resume: ResumePoint },
}

impl FetchError {
    /// Where a later attempt can continue, for failures that allow one.
    pub fn resume_point(&self) -> Option<&ResumePoint> {
        match self {
            FetchError::QuotaExceeded { resume, .. }
            | FetchError::Exhausted { resume, .. }
            | FetchError::Cancelled { resume } => Some(resume),
            FetchError::Auth(_) | FetchError::BadRequest(_) => None,
        }
    }
}

/// Failure of a single guarded request attempt.
#[derive(Debug)]
enum AttemptError {
    Quota(QuotaExceeded),
    Api(ApiError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Quota(err) => fmt::Display::fmt(err, f),
            AttemptError::Api(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl ClassifyRetry for AttemptError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            AttemptError::Quota(_) => RetryDisposition::NonRetryable,
            AttemptError::Api(err) => err.disposition(),
        }
    }
}

impl AttemptError {
    fn into_fetch_error(self, retry: &RetryPolicy, resume: ResumePoint) -> FetchError {
        match self {
            AttemptError::Quota(err) => FetchError::QuotaExceeded {
                reason: err.to_string(),
                resume,
            },
            AttemptError::Api(ApiError::QuotaExhausted(reason)) => FetchError::QuotaExceeded {
                reason: format!("platform quota exhausted: {reason}"),
                resume,
            },
            AttemptError::Api(ApiError::Auth(reason)) => FetchError::Auth(reason),
            AttemptError::Api(ApiError::BadRequest(reason)) => FetchError::BadRequest(reason),
            AttemptError::Api(ApiError::Transient(message)) => FetchError::Exhausted {
                attempts: retry.max_attempts.max(1),
                message,
                resume,
            },
        }
    }
}

/// Reserve quota, then issue the request, under the retry policy.
async fn guarded<T, F, Fut>(
    budget: &QuotaBudget,
    retry: &RetryPolicy,
    cost: u64,
    mut op: F,
) -> Result<T, AttemptError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    retry
        .run(|attempt| {
            let reserved = budget.try_reserve(cost);
            let request = op();
            async move {
                let spent = reserved.map_err(AttemptError::Quota)?;
                debug!(attempt, spent, "dispatching request");
                request.await.map_err(AttemptError::Api)
            }
        })
        .await
}

#[derive(Clone)]
pub struct QuotaAwareFetcher {
    api: Arc<dyn MetadataApi>,
    budget: Arc<QuotaBudget>,
    settings: FetchSettings,
}

impl fmt::Debug for QuotaAwareFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaAwareFetcher")
            .field("budget", &self.budget)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl QuotaAwareFetcher {
    pub fn new(api: Arc<dyn MetadataApi>, budget: Arc<QuotaBudget>, settings: FetchSettings) -> Self {
        Self {
            api,
            budget,
            settings,
        }
    }

    pub fn budget(&self) -> &QuotaBudget {
        &self.budget
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Start a lazy fetch of up to `item_limit` videos. An empty filter means the
    /// unfiltered chart; otherwise categories are visited in id order.
    pub fn fetch(
        &self,
        category_filter: &BTreeSet<String>,
        item_limit: usize,
        cancel: CancelSignal,
    ) -> FetchCursor {
        let categories = category_list(category_filter);
        let start = ResumePoint {
            category_index: 0,
            category_id: categories.first().cloned().flatten(),
            page_token: None,
            videos_emitted: 0,
        };
        self.resume(category_filter, item_limit, cancel, start)
    }

    /// Continue a fetch from a point reported by an earlier [`FetchError`].
    pub fn resume(
        &self,
        category_filter: &BTreeSet<String>,
        item_limit: usize,
        cancel: CancelSignal,
        from: ResumePoint,
    ) -> FetchCursor {
        FetchCursor {
            fetcher: self.clone(),
            categories: category_list(category_filter),
            item_limit,
            position: from,
            known_channels: HashSet::new(),
            cancel,
            finished: false,
        }
    }
}

fn category_list(filter: &BTreeSet<String>) -> Vec<Option<String>> {
    if filter.is_empty() {
        vec![None]
    } else {
        filter.iter().cloned().map(Some).collect()
    }
}

/// Restartable, finite page-by-page sequence of raw items.
///
/// Each call to [`FetchCursor::next_batch`] issues at most one video page request
/// plus the channel lookups that page needs. The cursor only advances once a page
/// and its channels have all arrived, so a failed page is re-requested on resume.
#[derive(Debug)]
pub struct FetchCursor {
    fetcher: QuotaAwareFetcher,
    categories: Vec<Option<String>>,
    item_limit: usize,
    position: ResumePoint,
    known_channels: HashSet<String>,
    cancel: CancelSignal,
    finished: bool,
}

impl FetchCursor {
    /// Skip lookups for channels an earlier (interrupted) cursor already returned.
    pub fn with_known_channels(mut self, channel_ids: impl IntoIterator<Item = String>) -> Self {
        self.known_channels.extend(channel_ids);
        self
    }

    pub fn position(&self) -> &ResumePoint {
        &self.position
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<RawItem>>, FetchError> {
        loop {
            if self.finished
                || self.position.videos_emitted >= self.item_limit
                || self.position.category_index >= self.categories.len()
            {
                self.finished = true;
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled {
                    resume: self.position.clone(),
                });
            }

            let remaining = self.item_limit - self.position.videos_emitted;
            let settings = &self.fetcher.settings;
            let request = VideoPageRequest {
                category_id: self.categories[self.position.category_index].clone(),
                page_token: self.position.page_token.clone(),
                max_results: settings
                    .page_size
                    .clamp(1, MAX_PAGE_SIZE)
                    .min(u32::try_from(remaining).unwrap_or(u32::MAX)),
                region_code: settings.region_code.clone(),
            };

            let api = &self.fetcher.api;
            let page = guarded(&self.fetcher.budget, &settings.retry, settings.page_cost, || {
                api.list_videos(&request)
            })
            .await
            .map_err(|err| err.into_fetch_error(&settings.retry, self.position.clone()))?;

            let fetched_at = Utc::now();
            let page_was_empty = page.items.is_empty();
            let videos = page
                .items
                .into_iter()
                .take(remaining)
                .map(|payload| RawItem {
                    kind: ItemKind::Video,
                    item_id: payload_id(ItemKind::Video, &payload).unwrap_or_default(),
                    fetched_at,
                    payload,
                })
                .collect::<Vec<_>>();

            let wanted = new_channel_ids(&videos, &self.known_channels);
            let channels = self.fetch_channels(wanted.clone()).await?;

            // Commit only once the whole page, channels included, is in hand.
            self.known_channels.extend(wanted);
            self.position.videos_emitted += videos.len();
            match page.next_page_token {
                Some(token) if !page_was_empty => self.position.page_token = Some(token),
                _ => {
                    self.position.category_index += 1;
                    self.position.category_id = self
                        .categories
                        .get(self.position.category_index)
                        .cloned()
                        .flatten();
                    self.position.page_token = None;
                }
            }

            info!(
                category = request.category_id.as_deref().unwrap_or("all"),
                videos = videos.len(),
                channels = channels.len(),
                quota_spent = self.fetcher.budget.spent(),
                "fetched page"
            );

            if videos.is_empty() && channels.is_empty() {
                continue;
            }
            let mut batch = videos;
            batch.extend(channels);
            return Ok(Some(batch));
        }
    }

    /// Look up channels in chunks, at most `max_in_flight` at a time. Results keep
    /// chunk order regardless of completion order.
    async fn fetch_channels(&self, channel_ids: Vec<String>) -> Result<Vec<RawItem>, FetchError> {
        if channel_ids.is_empty() {
            return Ok(Vec::new());
        }

        let settings = &self.fetcher.settings;
        let limiter = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        for (index, chunk) in channel_ids
            .chunks(MAX_PAGE_SIZE as usize)
            .map(<[String]>::to_vec)
            .enumerate()
        {
            let api = Arc::clone(&self.fetcher.api);
            let budget = Arc::clone(&self.fetcher.budget);
            let limiter = Arc::clone(&limiter);
            let retry = settings.retry;
            let cost = settings.page_cost;
            tasks.spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                let page = guarded(&budget, &retry, cost, || api.list_channels(&chunk)).await;
                (index, page)
            });
        }

        let mut pages: Vec<(usize, ApiPage)> = Vec::new();
        let mut first_error: Option<(usize, AttemptError)> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(page))) => pages.push((index, page)),
                Ok((index, Err(err))) => {
                    if first_error.as_ref().map_or(true, |(i, _)| index < *i) {
                        first_error = Some((index, err));
                    }
                }
                Err(join_err) => {
                    return Err(FetchError::Exhausted {
                        attempts: 1,
                        message: format!("channel lookup task failed: {join_err}"),
                        resume: self.position.clone(),
                    })
                }
            }
        }
        if let Some((_, err)) = first_error {
            return Err(err.into_fetch_error(&settings.retry, self.position.clone()));
        }

        pages.sort_by_key(|(index, _)| *index);
        let fetched_at = Utc::now();
        Ok(pages
            .into_iter()
            .flat_map(|(_, page)| page.items)
            .map(|payload| RawItem {
                kind: ItemKind::Channel,
                item_id: payload_id(ItemKind::Channel, &payload).unwrap_or_default(),
                fetched_at,
                payload,
            })
            .collect())
    }
}

fn new_channel_ids(videos: &[RawItem], known: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    videos
        .iter()
        .filter_map(|v| {
            v.payload
                .get("snippet")
                .and_then(|s| s.get("channelId"))
                .and_then(JsonValue::as_str)
        })
        .filter(|id| !id.is_empty() && !known.contains(*id))
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Endless chart: every page holds one video and points at another page.
    #[derive(Default)]
    struct EndlessApi {
        video_calls: AtomicUsize,
        channel_calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataApi for EndlessApi {
        async fn list_videos(&self, _request: &VideoPageRequest) -> Result<ApiPage, ApiError> {
            let n = self.video_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiPage {
                items: vec![json!({"id": format!("v{n}"), "snippet": {"channelId": "c1"}})],
                next_page_token: Some(format!("page-{}", n + 1)),
            })
        }

        async fn list_channels(&self, channel_ids: &[String]) -> Result<ApiPage, ApiError> {
            self.channel_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiPage {
                items: channel_ids.iter().map(|id| json!({"id": id})).collect(),
                next_page_token: None,
            })
        }
    }

    /// Plays back scripted video responses and records the requests it saw.
    #[derive(Default)]
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<ApiPage, ApiError>>>,
        requests: Mutex<Vec<VideoPageRequest>>,
        channel_requests: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<ApiPage, ApiError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MetadataApi for ScriptedApi {
        async fn list_videos(&self, request: &VideoPageRequest) -> Result<ApiPage, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::BadRequest("script exhausted".into())))
        }

        async fn list_channels(&self, channel_ids: &[String]) -> Result<ApiPage, ApiError> {
            self.channel_requests.lock().unwrap().push(channel_ids.to_vec());
            Ok(ApiPage {
                items: channel_ids.iter().map(|id| json!({"id": id})).collect(),
                next_page_token: None,
            })
        }
    }

    fn page(ids: &[&str], channel: &str, next: Option<&str>) -> Result<ApiPage, ApiError> {
        Ok(ApiPage {
            items: ids
                .iter()
                .map(|id| json!({"id": id, "snippet": {"channelId": channel}}))
                .collect(),
            next_page_token: next.map(str::to_string),
        })
    }

    fn settings(page_cost: u64, max_attempts: u32) -> FetchSettings {
        FetchSettings {
            page_cost,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..FetchSettings::default()
        }
    }

    fn fetcher(api: Arc<dyn MetadataApi>, budget: u64, settings: FetchSettings) -> QuotaAwareFetcher {
        QuotaAwareFetcher::new(api, Arc::new(QuotaBudget::new(budget)), settings)
    }

    async fn drain(cursor: &mut FetchCursor) -> (Vec<RawItem>, Option<FetchError>) {
        let mut items = Vec::new();
        loop {
            match cursor.next_batch().await {
                Ok(Some(batch)) => items.extend(batch),
                Ok(None) => return (items, None),
                Err(err) => return (items, Some(err)),
            }
        }
    }

    #[tokio::test]
    async fn quota_budget_caps_requests_before_dispatch() {
        let api = Arc::new(EndlessApi::default());
        let fetcher = fetcher(api.clone(), 100, settings(5, 3));
        let mut cursor = fetcher.fetch(&BTreeSet::new(), usize::MAX, CancelSignal::new());

        let (items, err) = drain(&mut cursor).await;
        let requests =
            api.video_calls.load(Ordering::SeqCst) + api.channel_calls.load(Ordering::SeqCst);
        assert_eq!(requests, 20);
        assert_eq!(fetcher.budget().spent(), 100);
        assert!(matches!(err, Some(FetchError::QuotaExceeded { .. })));
        // 19 video pages + the single channel lookup.
        assert_eq!(items.iter().filter(|i| i.kind == ItemKind::Video).count(), 19);
    }

    #[tokio::test]
    async fn zero_item_limit_yields_nothing_and_spends_nothing() {
        let api = Arc::new(EndlessApi::default());
        let fetcher = fetcher(api.clone(), 100, settings(1, 3));
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 0, CancelSignal::new());
        assert_eq!(cursor.next_batch().await.unwrap(), None);
        assert_eq!(api.video_calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.budget().spent(), 0);
    }

    #[tokio::test]
    async fn item_limit_stops_pagination_and_shrinks_page_size() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&["a", "b"], "c1", Some("t1")),
            page(&["c", "d"], "c1", Some("t2")),
        ]));
        let fetcher = fetcher(api.clone(), 100, FetchSettings { page_size: 2, ..settings(1, 1) });
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 3, CancelSignal::new());

        let (items, err) = drain(&mut cursor).await;
        assert!(err.is_none());
        let videos = items
            .iter()
            .filter(|i| i.kind == ItemKind::Video)
            .map(|i| i.item_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(videos, vec!["a", "b", "c"]);

        let requests = api.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].page_token.as_deref(), Some("t1"));
        assert_eq!(requests[1].max_results, 1);
        // c1 is looked up once even though both pages reference it.
        assert_eq!(api.channel_requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn categories_are_walked_in_order_with_fresh_tokens() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&["a"], "c1", Some("t1")),
            page(&["b"], "c2", None),
            page(&["c"], "c3", None),
        ]));
        let fetcher = fetcher(api.clone(), 100, settings(1, 1));
        let filter = BTreeSet::from(["20".to_string(), "10".to_string()]);
        let mut cursor = fetcher.fetch(&filter, 10, CancelSignal::new());

        let (items, err) = drain(&mut cursor).await;
        assert!(err.is_none());
        assert_eq!(items.iter().filter(|i| i.kind == ItemKind::Channel).count(), 3);

        let requests = api.requests.lock().unwrap().clone();
        let seen = requests
            .iter()
            .map(|r| (r.category_id.clone().unwrap(), r.page_token.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            seen,
            vec![
                ("10".to_string(), None),
                ("10".to_string(), Some("t1".to_string())),
                ("20".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_report_the_failed_page_token() {
        let transient = || Err(ApiError::Transient("502".into()));
        let api = Arc::new(ScriptedApi::new(vec![
            page(&["a"], "c1", Some("t1")),
            transient(),
            transient(),
            transient(),
            page(&["b"], "c1", None),
        ]));
        let fetcher = fetcher(api.clone(), 100, settings(1, 3));
        let filter = BTreeSet::new();
        let mut cursor = fetcher.fetch(&filter, 10, CancelSignal::new());

        let (items, err) = drain(&mut cursor).await;
        assert_eq!(items.iter().filter(|i| i.kind == ItemKind::Video).count(), 1);
        let err = err.expect("error");
        let FetchError::Exhausted { attempts, resume, .. } = &err else {
            panic!("unexpected {err:?}");
        };
        assert_eq!(*attempts, 3);
        assert_eq!(resume.page_token.as_deref(), Some("t1"));
        assert_eq!(resume.videos_emitted, 1);

        let mut resumed = fetcher
            .resume(&filter, 10, CancelSignal::new(), resume.clone())
            .with_known_channels(["c1".to_string()]);
        let (rest, err) = drain(&mut resumed).await;
        assert!(err.is_none());
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].item_id, "b");
        assert_eq!(api.requests.lock().unwrap().last().unwrap().page_token.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn auth_rejection_is_not_retried() {
        let api = Arc::new(ScriptedApi::new(vec![Err(ApiError::Auth("401".into()))]));
        let fetcher = fetcher(api.clone(), 100, settings(1, 3));
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 10, CancelSignal::new());
        assert!(matches!(cursor.next_batch().await, Err(FetchError::Auth(_))));
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn platform_quota_rejection_maps_to_quota_exceeded() {
        let api = Arc::new(ScriptedApi::new(vec![Err(ApiError::QuotaExhausted("403".into()))]));
        let fetcher = fetcher(api, 100, settings(1, 3));
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 10, CancelSignal::new());
        assert!(matches!(
            cursor.next_batch().await,
            Err(FetchError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_is_checked_between_pages() {
        let api = Arc::new(EndlessApi::default());
        let fetcher = fetcher(api.clone(), 1_000, settings(1, 1));
        let cancel = CancelSignal::new();
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 100, cancel.clone());

        assert!(cursor.next_batch().await.unwrap().is_some());
        cancel.cancel();
        let err = cursor.next_batch().await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(err.resume_point().unwrap().page_token.as_deref(), Some("page-1"));
        assert_eq!(api.video_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_lookups_are_chunked_and_share_the_budget() {
        let ids = (0..120).map(|i| format!("v{i}")).collect::<Vec<_>>();
        let items = ids
            .iter()
            .enumerate()
            .map(|(i, id)| json!({"id": id, "snippet": {"channelId": format!("c{i}")}}))
            .collect::<Vec<_>>();
        let api = Arc::new(ScriptedApi::new(vec![Ok(ApiPage {
            items,
            next_page_token: None,
        })]));
        let fetcher = fetcher(
            api.clone(),
            100,
            FetchSettings {
                page_size: 50,
                max_in_flight: 2,
                ..settings(1, 1)
            },
        );
        let mut cursor = fetcher.fetch(&BTreeSet::new(), 500, CancelSignal::new());
        let batch = cursor.next_batch().await.unwrap().unwrap();

        let channels = batch
            .iter()
            .filter(|i| i.kind == ItemKind::Channel)
            .map(|i| i.item_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(channels.len(), 120);
        assert_eq!(channels[0], "c0");
        assert_eq!(channels[119], "c119");
        assert_eq!(api.channel_requests.lock().unwrap().len(), 3);
        assert_eq!(fetcher.budget().spent(), 4);
    }
}
