use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tokio::{sync::mpsc, time};
use tracing::{error, info, warn};

use crate::{
    models::{Phase, PublishPlanInfo},
    pipeline::PublishPipeline,
    AppState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineJob {
    Build { plan_id: String },
    Run { plan_id: String, phase: Option<Phase> },
}

impl PipelineJob {
    pub fn plan_id(&self) -> &str {
        match self {
            Self::Build { plan_id } | Self::Run { plan_id, .. } => plan_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Run { .. } => "run",
        }
    }
}

/// Jobs run one at a time, so no two runs touch the file index concurrently.
pub fn spawn_pipeline_worker(state: AppState, mut queue_rx: mpsc::Receiver<PipelineJob>) {
    tokio::spawn(async move {
        while let Some(job) = queue_rx.recv().await {
            info!(plan_id = %job.plan_id(), job = job.kind(), "Worker picked pipeline job");
            if let Err(err) = process_job(&state.pipeline, &job).await {
                error!(plan_id = %job.plan_id(), job = job.kind(), "Pipeline job failed: {err:#}");
            }
        }
    });
}

pub fn spawn_cleanup_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(err) = purge_expired_plans(&state.pipeline, state.config.retention_seconds) {
                warn!("Cleanup worker error: {err:#}");
            }
        }
    });
}

pub async fn process_job(pipeline: &PublishPipeline, job: &PipelineJob) -> Result<PublishPlanInfo> {
    let info = match job {
        PipelineJob::Build { plan_id } => pipeline.build(plan_id).await?,
        PipelineJob::Run { plan_id, phase } => pipeline.run(plan_id, *phase).await?,
    };

    info!(
        plan_id = %info.plan.id,
        job = job.kind(),
        status = info.plan.status.as_str(),
        pending = info.entry_counts.pending,
        success = info.entry_counts.success,
        failed = info.entry_counts.failed,
        "Pipeline job finished"
    );
    Ok(info)
}

fn purge_expired_plans(pipeline: &PublishPipeline, retention_seconds: u64) -> Result<usize> {
    let cutoff = i64::try_from(retention_seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
        .with_context(|| format!("Plan retention of {retention_seconds}s is out of range"))?;
    let removed = pipeline.purge_finished_before(cutoff)?;
    if removed > 0 {
        info!(removed, "Expired finished publish plans");
    }
    Ok(removed)
}
