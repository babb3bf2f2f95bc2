use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{error, warn};

use crate::build::BuildIndex;
use crate::cluster::{Cluster, JobEvent};
use crate::error::Result;
use crate::labels::{JobKind, LABEL_BUILD, LABEL_JOB_KIND};
use crate::lifecycle::Lifecycle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

fn job_phase(job: &Job) -> Option<JobPhase> {
    let status = job.status.as_ref()?;
    if status.succeeded.unwrap_or(0) > 0 {
        Some(JobPhase::Succeeded)
    } else if status.failed.unwrap_or(0) > 0 {
        Some(JobPhase::Failed)
    } else if status.active.unwrap_or(0) > 0 {
        Some(JobPhase::Active)
    } else {
        None
    }
}

/// Consumes the job watch stream and drives the per-build init/cleanup transition
/// callbacks. A job event for a build the index (and a direct cluster read) can't
/// locate is treated as a resource leak and reclaimed.
pub async fn run_job_watcher(
    cluster: Arc<dyn Cluster>,
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
) -> Result<()> {
    let mut stream = cluster.watch_jobs();
    while let Some(event) = stream.next().await {
        match event? {
            JobEvent::Applied(job) => {
                if let Err(err) = handle_job_event(&index, &lifecycle, &job).await {
                    warn!(job = %job.name_any(), error = %err, "job transition callback failed");
                }
            }
            JobEvent::Deleted(_) => {}
            JobEvent::Restarted => {}
        }
    }
    error!("job watch stream ended");
    Ok(())
}

async fn handle_job_event(index: &Arc<BuildIndex>, lifecycle: &Arc<Lifecycle>, job: &Job) -> Result<()> {
    let labels = job.labels();
    let Some(build_name) = labels.get(LABEL_BUILD) else {
        return Ok(());
    };
    let Some(job_kind) = labels
        .get(LABEL_JOB_KIND)
        .and_then(|k| k.parse::<JobKind>().ok())
    else {
        return Ok(());
    };
    let Some(phase) = job_phase(job) else {
        return Ok(());
    };

    let build = match index.get(build_name) {
        Some(build) => build,
        None => match lifecycle.get_build(build_name, false).await {
            Ok(build) => build,
            Err(_) => {
                lifecycle.reap_orphaned_job(build_name).await?;
                return Ok(());
            }
        },
    };

    match (job_kind, phase) {
        (JobKind::Initialize, JobPhase::Active) => lifecycle.on_initialize_started(&build).await,
        (JobKind::Initialize, JobPhase::Succeeded) => lifecycle.on_initialize_succeeded(&build).await,
        (JobKind::Initialize, JobPhase::Failed) => lifecycle.on_initialize_failed(&build).await,
        (JobKind::Cleanup, JobPhase::Active) => lifecycle.on_cleanup_started(&build).await,
        (JobKind::Cleanup, JobPhase::Succeeded) => lifecycle.on_cleanup_succeeded(&build).await,
        (JobKind::Cleanup, JobPhase::Failed) => lifecycle.on_cleanup_failed(&build).await,
    }
}
