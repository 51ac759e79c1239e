//! Run configuration, metric derivation and the pipeline orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use streamdims_core::CancelSignal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod metrics;
pub mod orchestrator;

pub use config::{PipelineConfig, RetrySettings};
pub use metrics::{compute, metrics_for, rollup, MetricsConfig};
pub use orchestrator::{
    FailureReason, IllegalTransition, Pipeline, ResumeFrom, RunContext, RunState, RunSummary,
    StateChange,
};

pub const CRATE_NAME: &str = "streamdims-sync";

/// One job per configured cron expression. A tick that lands while a run is
/// still going is skipped rather than queued.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    cancel: CancelSignal,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &pipeline.config().scheduler_crons {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let cancel = cancel.clone();
            Box::pin(async move {
                scheduled_run(&pipeline, cancel).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

async fn scheduled_run(pipeline: &Pipeline, cancel: CancelSignal) {
    if cancel.is_cancelled() {
        return;
    }
    match pipeline.try_run(cancel).await {
        None => warn!("previous run still in progress; skipping scheduled run"),
        Some(Ok(summary)) if summary.succeeded() => info!(
            run_id = %summary.run_id,
            videos = summary.videos,
            "scheduled run complete"
        ),
        Some(Ok(summary)) => warn!(
            run_id = %summary.run_id,
            state = summary.state.as_str(),
            "scheduled run did not complete"
        ),
        Some(Err(err)) => error!(error = %err, "scheduled run aborted"),
    }
}
