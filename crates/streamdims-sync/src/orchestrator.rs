use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use streamdims_adapters::{
    normalize_in_batches, FetchError, MetadataApi, QuotaAwareFetcher, QuotaBudget, YouTubeDataApi,
};
use streamdims_core::{
    CancelSignal, ItemKind, ProcessedSnapshot, RawItem, ResumePoint, RunId, ValidationError,
};
use streamdims_storage::{DatasetStore, HttpClientConfig, HttpFetcher, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::PipelineConfig;
use crate::metrics::{compute, rollup};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("credential rejected: {0}")]
    Auth(String),
    #[error("request rejected: {0}")]
    BadRequest(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("fetch retries exhausted: {0}")]
    FetchExhausted(String),
    #[error("cancelled")]
    Cancelled,
    #[error("inconsistent snapshot: {0}")]
    Integrity(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<&FetchError> for FailureReason {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::Auth(msg) => FailureReason::Auth(msg.clone()),
            FetchError::BadRequest(msg) => FailureReason::BadRequest(msg.clone()),
            FetchError::QuotaExceeded { reason, .. } => FailureReason::QuotaExceeded(reason.clone()),
            FetchError::Exhausted { .. } => FailureReason::FetchExhausted(err.to_string()),
            FetchError::Cancelled { .. } => FailureReason::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Normalizing,
    ComputingMetrics,
    Persisting,
    Done,
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal run state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: &'static str,
    pub to: &'static str,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Normalizing => "normalizing",
            RunState::ComputingMetrics => "computing_metrics",
            RunState::Persisting => "persisting",
            RunState::Done => "done",
            RunState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed(_))
    }

    /// Stages run strictly in order; `Failed` is reachable from any non-terminal state.
    pub fn advance(&self, next: RunState) -> Result<RunState, IllegalTransition> {
        use RunState::*;
        let allowed = match (self, &next) {
            (Idle, Fetching)
            | (Fetching, Normalizing)
            | (Normalizing, ComputingMetrics)
            | (ComputingMetrics, Persisting)
            | (Persisting, Done) => true,
            (from, Failed(_)) => !from.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Per-run state: lives exactly as long as one pipeline run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub config: Arc<PipelineConfig>,
    pub cancel: CancelSignal,
    state: RunState,
    history: Vec<StateChange>,
}

impl RunContext {
    pub fn new(run_id: RunId, config: Arc<PipelineConfig>, cancel: CancelSignal) -> Self {
        Self {
            run_id,
            config,
            cancel,
            state: RunState::Idle,
            history: vec![StateChange {
                state: RunState::Idle,
                at: Utc::now(),
            }],
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), IllegalTransition> {
        let next = self.state.advance(next)?;
        match &next {
            RunState::Failed(reason) => {
                warn!(run_id = %self.run_id, from = self.state.as_str(), %reason, "run failed")
            }
            state => info!(run_id = %self.run_id, from = self.state.as_str(), to = state.as_str(), "run state"),
        }
        self.history.push(StateChange {
            state: next.clone(),
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: RunState,
    pub history: Vec<StateChange>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Fetch stage starts, counting restarts from a resume point.
    pub fetch_attempts: u32,
    pub quota_spent: u64,
    pub raw_items: usize,
    pub videos: usize,
    pub channels: usize,
    pub rejected: Vec<ValidationError>,
    /// Where a `--resume` run would continue, when the fetch stopped early.
    pub resume_point: Option<ResumePoint>,
    pub raw_snapshot: Option<PathBuf>,
    pub processed_snapshot: Option<PathBuf>,
}

impl RunSummary {
    fn begin(ctx: &RunContext) -> Self {
        let now = Utc::now();
        Self {
            run_id: ctx.run_id,
            state: ctx.state.clone(),
            history: Vec::new(),
            started_at: now,
            finished_at: now,
            fetch_attempts: 0,
            quota_spent: 0,
            raw_items: 0,
            videos: 0,
            channels: 0,
            rejected: Vec::new(),
            resume_point: None,
            raw_snapshot: None,
            processed_snapshot: None,
        }
    }

    fn close(mut self, ctx: RunContext) -> Self {
        self.state = ctx.state;
        self.history = ctx.history;
        self.finished_at = Utc::now();
        self
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Raw items and position of an incomplete earlier run.
#[derive(Debug, Clone)]
pub struct ResumeFrom {
    pub source_run: RunId,
    pub point: ResumePoint,
    pub items: Vec<RawItem>,
}

struct FetchOutcome {
    items: Vec<RawItem>,
    attempts: u32,
    error: Option<FetchError>,
}

/// Sequences fetch, normalize, compute and persist for one run at a time.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    api: Arc<dyn MetadataApi>,
    store: DatasetStore,
    last_run_id: Mutex<Option<RunId>>,
    running: tokio::sync::Mutex<()>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, api: Arc<dyn MetadataApi>) -> Self {
        let store = DatasetStore::new(config.data_dir.clone());
        Self {
            config: Arc::new(config),
            api,
            store,
            last_run_id: Mutex::new(None),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate `config` and wire it to the YouTube Data API over HTTP.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let credential = config
            .credential
            .clone()
            .context("no API credential: set YOUTUBE_API_KEY or STREAMDIMS_BEARER_TOKEN")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            max_in_flight: config.max_in_flight,
        })?;
        let api = YouTubeDataApi::new(http, config.api_base_url.clone(), credential);
        Ok(Self::new(config, Arc::new(api)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    fn next_run_id(&self) -> RunId {
        let mut last = self.last_run_id.lock().unwrap_or_else(PoisonError::into_inner);
        let run_id = match *last {
            Some(prev) => RunId::next_after(prev),
            None => RunId::now(),
        };
        *last = Some(run_id);
        run_id
    }

    /// The newest raw snapshot, if it was left incomplete with a resume point.
    pub async fn pending_resume(&self) -> Result<Option<ResumeFrom>, StoreError> {
        let Some(manifest) = self.store.latest_raw_manifest().await? else {
            return Ok(None);
        };
        let point = match (manifest.complete, manifest.resume_point) {
            (false, Some(point)) => point,
            _ => return Ok(None),
        };
        let items = self.store.read_raw_items(manifest.run_id).await?;
        Ok(Some(ResumeFrom {
            source_run: manifest.run_id,
            point,
            items,
        }))
    }

    pub async fn run(&self, cancel: CancelSignal) -> Result<RunSummary> {
        self.run_with(cancel, None).await
    }

    /// Run to completion, waiting for any run already in progress.
    pub async fn run_with(
        &self,
        cancel: CancelSignal,
        resume: Option<ResumeFrom>,
    ) -> Result<RunSummary> {
        let _running = self.running.lock().await;
        self.execute(cancel, resume).await
    }

    /// Run unless another run holds the pipeline, in which case return `None`.
    pub async fn try_run(&self, cancel: CancelSignal) -> Option<Result<RunSummary>> {
        let _running = self.running.try_lock().ok()?;
        Some(self.execute(cancel, None).await)
    }

    /// Failures of the run itself end up in the summary's state; `Err` means a
    /// transition bug.
    async fn execute(&self, cancel: CancelSignal, resume: Option<ResumeFrom>) -> Result<RunSummary> {
        let ctx = RunContext::new(self.next_run_id(), Arc::clone(&self.config), cancel);
        let span = info_span!("pipeline_run", run_id = %ctx.run_id);
        self.drive(ctx, resume).instrument(span).await
    }

    async fn drive(&self, mut ctx: RunContext, resume: Option<ResumeFrom>) -> Result<RunSummary> {
        let mut summary = RunSummary::begin(&ctx);
        if let Some(resume) = &resume {
            info!(
                source_run = %resume.source_run,
                carried_items = resume.items.len(),
                "resuming incomplete fetch"
            );
        }

        ctx.advance(RunState::Fetching)?;
        let budget = Arc::new(QuotaBudget::new(self.config.quota_budget));
        let outcome = self.fetch_stage(&ctx, Arc::clone(&budget), resume).await;
        summary.fetch_attempts = outcome.attempts;
        summary.quota_spent = budget.spent();
        summary.raw_items = outcome.items.len();

        if let Some(err) = outcome.error {
            summary.resume_point = err.resume_point().cloned();
            let keep_partial = matches!(err, FetchError::QuotaExceeded { .. })
                || (summary.resume_point.is_some() && !outcome.items.is_empty());
            if let (true, Some(point)) = (keep_partial, summary.resume_point.clone()) {
                match self.store.write_raw(ctx.run_id, &outcome.items, Some(point)).await {
                    Ok(published) => summary.raw_snapshot = Some(published.path),
                    Err(store_err) => {
                        error!(error = %store_err, "could not persist partial raw snapshot")
                    }
                }
            }
            ctx.advance(RunState::Failed(FailureReason::from(&err)))?;
            return Ok(summary.close(ctx));
        }

        match self.store.write_raw(ctx.run_id, &outcome.items, None).await {
            Ok(published) => summary.raw_snapshot = Some(published.path),
            Err(err) => {
                ctx.advance(RunState::Failed(FailureReason::Storage(err.to_string())))?;
                return Ok(summary.close(ctx));
            }
        }

        ctx.advance(RunState::Normalizing)?;
        let batch = match normalize_in_batches(
            &outcome.items,
            self.config.normalize_batch_size,
            &ctx.cancel,
        ) {
            Ok(batch) => batch,
            Err(cancelled) => {
                info!(processed = cancelled.processed, "normalization stopped");
                ctx.advance(RunState::Failed(FailureReason::Cancelled))?;
                return Ok(summary.close(ctx));
            }
        };
        summary.channels = batch.channels.len();
        summary.rejected = batch.rejected.clone();

        ctx.advance(RunState::ComputingMetrics)?;
        let metrics = compute(&batch.videos, &self.config.metrics_config());
        let mut snapshot = match ProcessedSnapshot::assemble(
            ctx.run_id,
            batch.videos,
            metrics,
            &batch.channels,
            Vec::new(),
            batch.rejected,
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                ctx.advance(RunState::Failed(FailureReason::Integrity(err.to_string())))?;
                return Ok(summary.close(ctx));
            }
        };
        snapshot.rollups = rollup(&snapshot.rows);
        summary.videos = snapshot.rows.len();

        if ctx.cancel.is_cancelled() {
            ctx.advance(RunState::Failed(FailureReason::Cancelled))?;
            return Ok(summary.close(ctx));
        }

        ctx.advance(RunState::Persisting)?;
        match self.store.write_processed(&snapshot).await {
            Ok(published) => summary.processed_snapshot = Some(published.path),
            Err(err) => {
                ctx.advance(RunState::Failed(FailureReason::Storage(err.to_string())))?;
                return Ok(summary.close(ctx));
            }
        }

        ctx.advance(RunState::Done)?;
        info!(
            videos = summary.videos,
            channels = summary.channels,
            rejected = summary.rejected.len(),
            quota_spent = summary.quota_spent,
            "run complete"
        );
        Ok(summary.close(ctx))
    }

    /// Drain the fetcher, restarting from the reported resume point when the
    /// fetcher's own retries run out.
    async fn fetch_stage(
        &self,
        ctx: &RunContext,
        budget: Arc<QuotaBudget>,
        resume: Option<ResumeFrom>,
    ) -> FetchOutcome {
        let fetcher =
            QuotaAwareFetcher::new(Arc::clone(&self.api), budget, self.config.fetch_settings());
        let policy = self.config.orchestrator_retry.policy();
        let (mut items, mut start) = match resume {
            Some(resume) => (resume.items, Some(resume.point)),
            None => (Vec::new(), None),
        };

        let mut attempt = 0u32;
        loop {
            let known_channels = items
                .iter()
                .filter(|item| item.kind == ItemKind::Channel)
                .map(|item| item.item_id.clone())
                .collect::<Vec<_>>();
            let cursor = match start.take() {
                Some(point) => fetcher.resume(
                    &self.config.categories,
                    self.config.item_limit,
                    ctx.cancel.clone(),
                    point,
                ),
                None => fetcher.fetch(
                    &self.config.categories,
                    self.config.item_limit,
                    ctx.cancel.clone(),
                ),
            };
            let mut cursor = cursor.with_known_channels(known_channels);

            let error = loop {
                match cursor.next_batch().await {
                    Ok(Some(batch)) => items.extend(batch),
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            };

            match error {
                Some(FetchError::Exhausted { message, resume, .. })
                    if attempt + 1 < policy.max_attempts =>
                {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "fetch stage exhausted; restarting from resume point"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    start = Some(resume);
                }
                error => {
                    return FetchOutcome {
                        items,
                        attempts: attempt + 1,
                        error,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrySettings;
    use async_trait::async_trait;
    use serde_json::{json, Value as JsonValue};
    use std::collections::{BTreeSet, VecDeque};
    use std::path::Path;
    use streamdims_adapters::{ApiError, ApiPage, VideoPageRequest};

    fn fixture(name: &str) -> JsonValue {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/youtube")
            .join(name);
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    /// Scripted video pages; channel lookups answer from the fixture file.
    #[derive(Default)]
    struct FakeApi {
        videos: std::sync::Mutex<VecDeque<Result<ApiPage, ApiError>>>,
    }

    impl FakeApi {
        fn new(pages: Vec<Result<ApiPage, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                videos: std::sync::Mutex::new(pages.into()),
            })
        }
    }

    #[async_trait]
    impl MetadataApi for FakeApi {
        async fn list_videos(&self, _request: &VideoPageRequest) -> Result<ApiPage, ApiError> {
            self.videos
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ApiError::BadRequest("no more scripted pages".into())))
        }

        async fn list_channels(&self, channel_ids: &[String]) -> Result<ApiPage, ApiError> {
            let mut page = ApiPage::from_json(fixture("channels_page.json"))?;
            page.items.retain(|item| {
                item["id"]
                    .as_str()
                    .is_some_and(|id| channel_ids.iter().any(|c| c == id))
            });
            Ok(page)
        }
    }

    fn fixture_page() -> Result<ApiPage, ApiError> {
        ApiPage::from_json(fixture("videos_page.json"))
    }

    fn paged(mut page: ApiPage, token: &str) -> Result<ApiPage, ApiError> {
        page.next_page_token = Some(token.to_string());
        Ok(page)
    }

    fn video_page(ids: &[&str], token: Option<&str>) -> Result<ApiPage, ApiError> {
        Ok(ApiPage {
            items: ids
                .iter()
                .map(|id| {
                    json!({
                        "id": id,
                        "snippet": {"channelId": "UCgameplay000000000000", "categoryId": "20"},
                        "contentDetails": {"duration": "PT10M", "adBreakCount": 2},
                        "statistics": {"viewCount": "100", "likeCount": "5"}
                    })
                })
                .collect(),
            next_page_token: token.map(str::to_string),
        })
    }

    fn config(data_dir: &Path) -> PipelineConfig {
        let quick = RetrySettings {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
        };
        PipelineConfig {
            data_dir: data_dir.to_path_buf(),
            fetch_retry: quick,
            orchestrator_retry: quick,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(config: PipelineConfig, api: Arc<FakeApi>) -> Pipeline {
        Pipeline::new(config, api)
    }

    fn states(summary: &RunSummary) -> Vec<&'static str> {
        summary.history.iter().map(|c| c.state.as_str()).collect()
    }

    #[test]
    fn state_machine_only_moves_forward() {
        let fetching = RunState::Idle.advance(RunState::Fetching).unwrap();
        assert!(fetching.advance(RunState::Persisting).is_err());
        assert!(RunState::Idle.advance(RunState::Done).is_err());
        assert!(RunState::Persisting
            .advance(RunState::Failed(FailureReason::Cancelled))
            .is_ok());
        assert_eq!(
            RunState::Done.advance(RunState::Failed(FailureReason::Cancelled)),
            Err(IllegalTransition {
                from: "done",
                to: "failed"
            })
        );
        assert!(RunState::Failed(FailureReason::Cancelled)
            .advance(RunState::Fetching)
            .is_err());
    }

    #[tokio::test]
    async fn successful_run_publishes_a_processed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(config(dir.path()), FakeApi::new(vec![fixture_page()]));

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(summary.succeeded(), "{:?}", summary.state);
        assert_eq!(
            states(&summary),
            vec!["idle", "fetching", "normalizing", "computing_metrics", "persisting", "done"]
        );
        assert_eq!(summary.videos, 3);
        assert_eq!(summary.channels, 2);
        assert_eq!(summary.rejected.len(), 1);
        assert_eq!(summary.rejected[0].item_id(), "BrokenDur01");
        assert_eq!(summary.quota_spent, 2);

        let snapshot = pipeline.store().read_latest_processed().await.unwrap();
        assert_eq!(snapshot.run_id, summary.run_id);
        assert_eq!(snapshot.rows.len(), 3);
        assert!(snapshot.rows.iter().all(|r| r.channel.is_some()));
        let premiere = snapshot
            .rows
            .iter()
            .find(|r| r.video.video_id == "LiveNow0001")
            .unwrap();
        assert_eq!(premiere.metrics.ad_density, None);

        let categories = snapshot
            .rollups
            .iter()
            .map(|r| r.category_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(categories, vec!["10", "20"]);
        assert_eq!(snapshot.rollups[1].undefined_density_count, 1);
    }

    #[tokio::test]
    async fn quota_exhaustion_keeps_raw_items_but_publishes_nothing_processed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.quota_budget = 2;
        let api = FakeApi::new(vec![
            paged(fixture_page().unwrap(), "next-1"),
            video_page(&["late"], None),
        ]);
        let pipeline = pipeline(config, api);

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(matches!(
            summary.state,
            RunState::Failed(FailureReason::QuotaExceeded(_))
        ));
        assert_eq!(summary.processed_snapshot, None);
        assert!(matches!(
            pipeline.store().read_latest_processed().await,
            Err(StoreError::NoDataAvailable)
        ));

        let manifest = pipeline.store().latest_raw_manifest().await.unwrap().unwrap();
        assert!(!manifest.complete);
        assert_eq!(manifest.counts.get("video"), Some(&4));
        let point = manifest.resume_point.unwrap();
        assert_eq!(point.page_token.as_deref(), Some("next-1"));
        assert_eq!(point.videos_emitted, 4);
    }

    #[tokio::test]
    async fn resumed_run_carries_earlier_items_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.quota_budget = 2;
        let api = FakeApi::new(vec![
            paged(fixture_page().unwrap(), "next-1"),
            video_page(&["late"], None),
        ]);
        let mut pipeline = pipeline(config, api);
        let first = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(!first.succeeded());

        let resume = pipeline.pending_resume().await.unwrap().unwrap();
        assert_eq!(resume.source_run, first.run_id);
        Arc::get_mut(&mut pipeline.config).unwrap().quota_budget = 10;

        let second = pipeline
            .run_with(CancelSignal::new(), Some(resume))
            .await
            .unwrap();
        assert!(second.succeeded(), "{:?}", second.state);
        assert!(second.run_id > first.run_id);
        assert_eq!(second.videos, 4);
        // Channels came with the first run; the resumed fetch looks up none.
        assert_eq!(second.quota_spent, 1);
        assert!(pipeline.pending_resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_fetch_restarts_from_its_resume_point() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.orchestrator_retry.max_attempts = 2;
        let api = FakeApi::new(vec![
            video_page(&["a"], Some("t1")),
            Err(ApiError::Transient("503".into())),
            video_page(&["b"], None),
        ]);
        let pipeline = pipeline(config, api);

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(summary.succeeded(), "{:?}", summary.state);
        assert_eq!(summary.fetch_attempts, 2);
        assert_eq!(summary.videos, 2);
    }

    #[tokio::test]
    async fn exhausted_fetch_without_retries_fails_and_keeps_partial_items() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(vec![
            video_page(&["a"], Some("t1")),
            Err(ApiError::Transient("503".into())),
        ]);
        let pipeline = pipeline(config(dir.path()), api);

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(matches!(
            summary.state,
            RunState::Failed(FailureReason::FetchExhausted(_))
        ));
        assert_eq!(
            summary.resume_point.as_ref().and_then(|p| p.page_token.as_deref()),
            Some("t1")
        );
        assert!(summary.raw_snapshot.is_some());
        assert!(pipeline.pending_resume().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn auth_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(vec![Err(ApiError::Auth("401".into()))]);
        let pipeline = pipeline(config(dir.path()), api);

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert_eq!(states(&summary), vec!["idle", "fetching", "failed"]);
        assert!(matches!(summary.state, RunState::Failed(FailureReason::Auth(_))));
        assert!(pipeline.store().latest_raw_manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_run_leaves_previous_snapshot_readable() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(vec![fixture_page(), Err(ApiError::BadRequest("400".into()))]);
        let pipeline = pipeline(config(dir.path()), api);

        let good = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(good.succeeded());
        let bad = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(matches!(bad.state, RunState::Failed(FailureReason::BadRequest(_))));

        let latest = pipeline.store().read_latest_processed().await.unwrap();
        assert_eq!(latest.run_id, good.run_id);
    }

    #[tokio::test]
    async fn cancelled_run_ends_failed_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(config(dir.path()), FakeApi::new(vec![fixture_page()]));
        let cancel = CancelSignal::new();
        cancel.cancel();

        let summary = pipeline.run(cancel).await.unwrap();
        assert_eq!(summary.state, RunState::Failed(FailureReason::Cancelled));
        assert!(matches!(
            pipeline.store().read_latest_processed().await,
            Err(StoreError::NoDataAvailable)
        ));
    }

    #[tokio::test]
    async fn category_filter_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.categories = BTreeSet::from(["20".to_string()]);
        let pipeline = pipeline(config, FakeApi::new(vec![video_page(&["a", "b"], None)]));

        let summary = pipeline.run(CancelSignal::new()).await.unwrap();
        assert!(summary.succeeded());
        let snapshot = pipeline.store().read_latest_processed().await.unwrap();
        assert_eq!(snapshot.rollups.len(), 1);
        assert_eq!(snapshot.rollups[0].category_name, "Gaming");
        assert_eq!(snapshot.rollups[0].mean_ad_density, Some(0.2));
    }
}
