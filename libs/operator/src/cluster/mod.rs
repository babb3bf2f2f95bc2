mod fake;
mod kube_cluster;

pub use fake::FakeCluster;
pub use kube_cluster::KubeCluster;

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;

use crate::build::PatchOp;
use crate::error::Result;
use crate::labels::JobKind;

/// Everything the controller needs from the cluster, behind a trait so reconcilers can
/// be exercised against an in-memory fake instead of a real API server.
///
/// A narrow surface: watch two resource kinds, and mutate them through patches, applies
/// and deletes scoped by the `runboat/build` label.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// A never-ending stream of build deployment watch events, restartable by the
    /// caller's supervisor whenever it terminates.
    fn watch_deployments(&self) -> BoxStream<'static, Result<DeploymentEvent>>;

    /// A never-ending stream of build job watch events (initialize/cleanup jobs).
    fn watch_jobs(&self) -> BoxStream<'static, Result<JobEvent>>;

    /// Applies a batch of JSON-patch operations to a deployment.
    async fn patch_deployment(&self, namespace: &str, name: &str, ops: &[PatchOp]) -> Result<()>;

    /// Server-side applies a full manifest (deployment, service, ingress, ...),
    /// dry-run first and then for real, matching the two-phase apply the manifest
    /// renderer expects.
    async fn apply(&self, namespace: &str, manifest: &serde_json::Value) -> Result<()>;

    /// Direct, one-shot read of a deployment, used by the job watcher and
    /// `get_build`'s fallback path when a build isn't yet in the index.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Deletes every namespaced resource carrying `runboat/build=<build>`, used when
    /// undeploying a build's non-deployment resources (service, ingress, jobs, ...).
    async fn delete_labeled_resources(&self, namespace: &str, build: &str) -> Result<()>;

    /// Runs a one-shot job (initialize or cleanup) for `build` and returns once the job
    /// is created; completion is observed later through [`Cluster::watch_jobs`].
    async fn run_job(&self, namespace: &str, job: &Job) -> Result<()>;

    /// Deletes a job, used to cancel a stale initialize/cleanup job before redeploying.
    async fn kill_job(&self, namespace: &str, name: &str) -> Result<()>;

    /// Tails the log of the first pod carrying `runboat/build=<build>`, optionally
    /// narrowed to `runboat/job-kind=<job_kind>` (the initialize/cleanup job's pod);
    /// `None` selects the running application pod instead. Pods are named by the
    /// orchestrator with a generated suffix, so callers never know a pod name up
    /// front -- only the build/job-kind labels it carries.
    async fn read_log(&self, namespace: &str, build: &str, job_kind: Option<JobKind>) -> Result<String>;
}

#[derive(Clone, Debug)]
pub enum DeploymentEvent {
    Applied(Box<Deployment>),
    Deleted(Box<Deployment>),
    /// The watch stream restarted; listeners should treat this as "relist from
    /// scratch" and clear anything derived from a prior generation.
    Restarted,
}

#[derive(Clone, Debug)]
pub enum JobEvent {
    Applied(Box<Job>),
    Deleted(Box<Job>),
    Restarted,
}
