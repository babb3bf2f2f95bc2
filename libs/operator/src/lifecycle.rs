use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::build::{
    patch_init_status, patch_last_scaled, patch_remove_finalizer, patch_replicas, Build,
    BuildIndex, BuildStatus, CommitInfo, InitStatus, PatchOp, SearchFilter, SortOrder,
};
use crate::cluster::Cluster;
use crate::commit_status::{CommitStatusNotifier, CommitStatusState};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::labels::JobKind;
use crate::manifest::{ManifestMode, ManifestRenderer};

/// Aggregate counters mirroring the operation contract's `controller_status`.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct ControllerStatus {
    pub stopped: usize,
    pub failed: usize,
    pub started: usize,
    pub max_started: usize,
    pub initializing: usize,
    pub max_initializing: usize,
    pub to_initialize: usize,
    pub undeploying: usize,
    pub deployed: usize,
    pub max_deployed: usize,
}

/// The public surface consumed by HTTP/webhook collaborators: deploy, search,
/// per-build lifecycle actions, and the transition callbacks the job watcher invokes.
/// Everything here suspends on cluster I/O; none of it touches the index except
/// through reads and the `get_build` fallback insert.
pub struct Lifecycle {
    cluster: Arc<dyn Cluster>,
    index: Arc<BuildIndex>,
    notifier: Arc<dyn CommitStatusNotifier>,
    renderer: Arc<dyn ManifestRenderer>,
    config: ControllerConfig,
}

impl Lifecycle {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        index: Arc<BuildIndex>,
        notifier: Arc<dyn CommitStatusNotifier>,
        renderer: Arc<dyn ManifestRenderer>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            index,
            notifier,
            renderer,
            config,
        }
    }

    fn namespace(&self) -> &str {
        &self.config.build_namespace
    }

    /// Applies only the ops whose target value actually differs from `build`'s current
    /// snapshot, and reports whether anything was sent to the cluster. Suppresses the
    /// entire patch when nothing changed.
    async fn patch(
        &self,
        build: &Build,
        init_status: Option<InitStatus>,
        replicas: Option<i32>,
    ) -> Result<bool> {
        let mut ops: Vec<PatchOp> = Vec::new();
        if let Some(status) = init_status {
            if status != build.init_status {
                ops.push(patch_init_status(status));
            }
        }
        if let Some(desired) = replicas {
            if desired != build.desired_replicas {
                ops.push(patch_replicas(desired));
                ops.push(patch_last_scaled(Utc::now()));
            }
        }
        if ops.is_empty() {
            return Ok(false);
        }
        self.cluster
            .patch_deployment(self.namespace(), &build.deployment_name, &ops)
            .await?;
        Ok(true)
    }

    /// Looks a build up by commit info; if none exists yet, creates a fresh deployment
    /// (`init_status = todo`, `desired_replicas = 0`) and posts a pending commit
    /// status. Idempotent under webhook replay: a second call with the same commit
    /// info is a no-op.
    pub async fn deploy_commit(&self, commit_info: CommitInfo) -> Result<Build> {
        if let Some(existing) = self.index.get_for_commit(&commit_info) {
            return Ok(existing);
        }

        let build_name = Uuid::new_v4().to_string();
        let manifests = self
            .renderer
            .render(&build_name, &commit_info, ManifestMode::Deploy);
        for manifest in &manifests {
            self.cluster.apply(self.namespace(), manifest).await?;
        }
        self.notifier
            .notify(&commit_info, CommitStatusState::Pending, None)
            .await;

        info!(build = %build_name, repo = %commit_info.repo, "deployed new build");

        // The deployment watcher will observe the applied deployment and add it to the
        // index; callers that need the build synchronously fall back to a direct read.
        self.get_build(&build_name, false).await
    }

    /// Transitions every build matching `filter` to undeploying.
    pub async fn undeploy_builds(&self, filter: &SearchFilter) -> Result<usize> {
        let matching = self.index.search(filter, SortOrder::default());
        let count = matching.len();
        for build in matching {
            self.undeploy(&build).await?;
        }
        Ok(count)
    }

    /// Looks a build up by name. When `db_only` is false and the index misses, falls
    /// back to a direct cluster read and, on success, inserts the result into the
    /// index -- the re-entry path job events on unknown builds rely on.
    pub async fn get_build(&self, name: &str, db_only: bool) -> Result<Build> {
        if let Some(build) = self.index.get(name) {
            return Ok(build);
        }
        let not_found = || crate::error::Error::MissingAnnotation {
            deployment: name.to_string(),
            key: "runboat/build".to_string(),
        };
        if db_only {
            return Err(not_found());
        }
        match self.cluster.get_deployment(self.namespace(), name).await? {
            Some(deployment) => {
                let build = Build::from_deployment(&deployment)?;
                self.index.add(build.clone());
                Ok(build)
            }
            None => Err(not_found()),
        }
    }

    pub fn controller_status(&self) -> ControllerStatus {
        ControllerStatus {
            stopped: self.index.count_by_status(BuildStatus::Stopped),
            failed: self.index.count_by_status(BuildStatus::Failed),
            started: self.index.count_by_status(BuildStatus::Started),
            max_started: self.config.max_started,
            initializing: self.index.count_by_init_status(InitStatus::Started),
            max_initializing: self.config.max_initializing,
            to_initialize: self.index.to_initialize().len(),
            undeploying: self.index.count_by_status(BuildStatus::Undeploying),
            deployed: self.index.count_deployed(),
            max_deployed: self.config.max_deployed,
        }
    }

    /// Reconciler action: applies the initialize-mode manifests (typically a one-shot
    /// job) for a build whose `init_status = todo`.
    pub async fn initialize(&self, build: &Build) -> Result<()> {
        let manifests = self
            .renderer
            .render(&build.deployment_name, &build.commit_info, ManifestMode::Initialize);
        for manifest in &manifests {
            self.cluster.apply(self.namespace(), manifest).await?;
        }
        Ok(())
    }

    /// Reconciler action: kills any initialize job, scales to zero and applies the
    /// cleanup-mode manifests (typically a one-shot job).
    pub async fn cleanup(&self, build: &Build) -> Result<()> {
        self.cluster
            .kill_job(self.namespace(), &format!("{}-{}", build.deployment_name, JobKind::Initialize))
            .await
            .ok();
        self.patch(build, None, Some(0)).await?;
        let manifests = self
            .renderer
            .render(&build.deployment_name, &build.commit_info, ManifestMode::Cleanup);
        for manifest in &manifests {
            self.cluster.apply(self.namespace(), manifest).await?;
        }
        Ok(())
    }

    /// No-op with a log line unless `status ∈ {stopped, stopping}`.
    pub async fn start(&self, build: &Build) -> Result<()> {
        if !matches!(build.status, BuildStatus::Stopped | BuildStatus::Stopping) {
            warn!(build = %build.name, status = ?build.status, "start() guard failed, ignoring");
            return Ok(());
        }
        self.patch(build, None, Some(1)).await?;
        Ok(())
    }

    /// No-op with a log line unless `status = started`.
    pub async fn stop(&self, build: &Build) -> Result<()> {
        if build.status != BuildStatus::Started {
            warn!(build = %build.name, status = ?build.status, "stop() guard failed, ignoring");
            return Ok(());
        }
        self.patch(build, None, Some(0)).await?;
        Ok(())
    }

    /// Kills both jobs and re-applies the deployment manifest, resetting
    /// `init_status` to `todo` through the renderer and the patch below.
    pub async fn redeploy(&self, build: &Build) -> Result<()> {
        self.cluster
            .kill_job(self.namespace(), &format!("{}-{}", build.deployment_name, JobKind::Cleanup))
            .await
            .ok();
        self.cluster
            .kill_job(self.namespace(), &format!("{}-{}", build.deployment_name, JobKind::Initialize))
            .await
            .ok();
        let manifests = self
            .renderer
            .render(&build.deployment_name, &build.commit_info, ManifestMode::Deploy);
        for manifest in &manifests {
            self.cluster.apply(self.namespace(), manifest).await?;
        }
        self.patch(build, Some(InitStatus::Todo), Some(0)).await?;
        Ok(())
    }

    /// Requests deletion of the deployment; the finalizer holds it alive until the
    /// cleaner reconciler runs the cleanup job to completion.
    pub async fn undeploy(&self, build: &Build) -> Result<()> {
        self.cluster
            .delete_deployment(self.namespace(), &build.deployment_name)
            .await?;
        Ok(())
    }

    pub async fn on_initialize_started(&self, build: &Build) -> Result<()> {
        if build.init_status == InitStatus::Started {
            return Ok(());
        }
        let touched = self.patch(build, Some(InitStatus::Started), Some(0)).await?;
        if touched {
            self.notifier
                .notify(&build.commit_info, CommitStatusState::Pending, Some(&self.live_url(build)))
                .await;
        }
        Ok(())
    }

    pub async fn on_initialize_succeeded(&self, build: &Build) -> Result<()> {
        if build.init_status == InitStatus::Succeeded {
            return Ok(());
        }
        let touched = self.patch(build, Some(InitStatus::Succeeded), None).await?;
        if touched {
            self.notifier
                .notify(&build.commit_info, CommitStatusState::Success, Some(&self.live_url(build)))
                .await;
        }
        Ok(())
    }

    pub async fn on_initialize_failed(&self, build: &Build) -> Result<()> {
        if build.init_status == InitStatus::Failed {
            return Ok(());
        }
        let touched = self.patch(build, Some(InitStatus::Failed), Some(0)).await?;
        if touched {
            self.notifier
                .notify(&build.commit_info, CommitStatusState::Failure, None)
                .await;
        }
        Ok(())
    }

    pub async fn on_cleanup_started(&self, build: &Build) -> Result<()> {
        info!(build = %build.name, "cleanup job started");
        Ok(())
    }

    /// Deletes every resource labeled with the build and removes its finalizer,
    /// allowing Kubernetes to finally delete the deployment.
    pub async fn on_cleanup_succeeded(&self, build: &Build) -> Result<()> {
        self.cluster
            .delete_labeled_resources(self.namespace(), &build.name)
            .await?;
        self.cluster
            .patch_deployment(self.namespace(), &build.deployment_name, &[patch_remove_finalizer()])
            .await
            .ok();
        Ok(())
    }

    /// Logged, not retried automatically: a failing cleanup job usually means a
    /// misconfigured cluster, and automatic retries would just hammer it.
    pub async fn on_cleanup_failed(&self, build: &Build) -> Result<()> {
        warn!(build = %build.name, "cleanup job failed, manual intervention required");
        Ok(())
    }

    /// Handles a job event carrying a build the index (and a direct cluster read)
    /// cannot locate: the job is orphaned, so its resources are reclaimed instead of
    /// leaking.
    pub async fn reap_orphaned_job(&self, build_name: &str) -> Result<()> {
        warn!(build = %build_name, "orphaned job, deleting labeled resources");
        self.cluster
            .delete_labeled_resources(self.namespace(), build_name)
            .await
    }

    pub async fn init_log(&self, build: &Build) -> Result<String> {
        self.cluster
            .read_log(self.namespace(), &build.name, Some(JobKind::Initialize))
            .await
    }

    pub async fn log(&self, build: &Build) -> Result<String> {
        self.cluster.read_log(self.namespace(), &build.name, None).await
    }

    fn live_url(&self, build: &Build) -> String {
        format!("https://{}.{}", build.slug(), self.config.build_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::FakeCluster;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            build_namespace: "runboat-builds".to_string(),
            build_domain: "builds.example.com".to_string(),
            max_initializing: 2,
            max_started: 6,
            max_deployed: 10,
            event_buffering_delay_secs: 1,
            reconciler_max_wait_secs: 10,
            supervisor_restart_delay_secs: 5,
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(CommitInfo, CommitStatusState, Option<String>)>>,
    }

    #[async_trait]
    impl CommitStatusNotifier for RecordingNotifier {
        async fn notify(&self, commit_info: &CommitInfo, state: CommitStatusState, target_url: Option<&str>) {
            self.calls
                .lock()
                .unwrap()
                .push((commit_info.clone(), state, target_url.map(str::to_string)));
        }
    }

    struct StubRenderer;

    impl ManifestRenderer for StubRenderer {
        fn render(&self, build_name: &str, _commit_info: &CommitInfo, _mode: ManifestMode) -> Vec<Value> {
            vec![serde_json::json!({"kind": "Deployment", "metadata": {"name": build_name}})]
        }
    }

    fn test_lifecycle() -> (Arc<Lifecycle>, Arc<FakeCluster>, Arc<BuildIndex>, Arc<RecordingNotifier>) {
        let cluster = Arc::new(FakeCluster::new());
        let index = Arc::new(BuildIndex::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let lifecycle = Arc::new(Lifecycle::new(
            cluster.clone(),
            index.clone(),
            notifier.clone(),
            Arc::new(StubRenderer),
            test_config(),
        ));
        (lifecycle, cluster, index, notifier)
    }

    #[tokio::test]
    async fn deploy_commit_is_idempotent() {
        let (lifecycle, cluster, index, notifier) = test_lifecycle();
        let ci = CommitInfo::new("oca/mis-builder", "15.0", Some(381), "abcde0123456789");

        let build = Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: ci.clone(),
            status: BuildStatus::Initializing,
            init_status: InitStatus::Todo,
            desired_replicas: 0,
            last_scaled: None,
            created: Utc::now(),
        };
        index.add(build.clone());

        let result = lifecycle.deploy_commit(ci).await.unwrap();
        assert_eq!(result.name, "b1");
        assert_eq!(cluster.applies.lock().unwrap().len(), 0, "existing build short-circuits apply");
        assert_eq!(notifier.calls.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn patch_suppressed_when_nothing_changed() {
        let (lifecycle, cluster, _index, _notifier) = test_lifecycle();
        let build = Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status: BuildStatus::Started,
            init_status: InitStatus::Succeeded,
            desired_replicas: 1,
            last_scaled: None,
            created: Utc::now(),
        };

        let touched = lifecycle.patch(&build, Some(InitStatus::Succeeded), Some(1)).await.unwrap();
        assert!(!touched);
        assert_eq!(cluster.patches.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn stop_is_noop_unless_started() {
        let (lifecycle, cluster, _index, _notifier) = test_lifecycle();
        let build = Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status: BuildStatus::Stopped,
            init_status: InitStatus::Succeeded,
            desired_replicas: 0,
            last_scaled: None,
            created: Utc::now(),
        };

        lifecycle.stop(&build).await.unwrap();
        assert_eq!(cluster.patches.lock().unwrap().len(), 0, "guard blocks the patch");
    }

    #[tokio::test]
    async fn on_initialize_succeeded_notifies_success() {
        let (lifecycle, _cluster, _index, notifier) = test_lifecycle();
        let build = Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status: BuildStatus::Initializing,
            init_status: InitStatus::Started,
            desired_replicas: 0,
            last_scaled: None,
            created: Utc::now(),
        };

        lifecycle.on_initialize_succeeded(&build).await.unwrap();
        let calls = notifier.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, CommitStatusState::Success);
    }

    #[tokio::test]
    async fn undeploy_builds_matches_search_filter() {
        let (lifecycle, cluster, index, _notifier) = test_lifecycle();
        index.add(Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status: BuildStatus::Stopped,
            init_status: InitStatus::Succeeded,
            desired_replicas: 0,
            last_scaled: None,
            created: Utc::now(),
        });
        index.add(Build {
            name: "b2".to_string(),
            deployment_name: "b2".to_string(),
            commit_info: CommitInfo::new("oca/other", "16.0", None, "def456"),
            status: BuildStatus::Stopped,
            init_status: InitStatus::Succeeded,
            desired_replicas: 0,
            last_scaled: None,
            created: Utc::now(),
        });

        let count = lifecycle
            .undeploy_builds(&SearchFilter {
                repo: Some("oca/repo".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(cluster.deleted_deployments.lock().unwrap().len(), 1);
        assert_eq!(cluster.deleted_deployments.lock().unwrap()[0].1, "b1");
    }

    #[tokio::test]
    async fn init_log_and_log_select_pods_by_build_and_job_kind() {
        let (lifecycle, cluster, _index, _notifier) = test_lifecycle();
        let build = Build {
            name: "b1".to_string(),
            deployment_name: "b1".to_string(),
            commit_info: CommitInfo::new("oca/repo", "16.0", None, "abc123"),
            status: BuildStatus::Started,
            init_status: InitStatus::Succeeded,
            desired_replicas: 1,
            last_scaled: None,
            created: Utc::now(),
        };

        lifecycle.init_log(&build).await.unwrap();
        lifecycle.log(&build).await.unwrap();

        let reads = cluster.logs_read.lock().unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0], ("b1".to_string(), Some(JobKind::Initialize)));
        assert_eq!(reads[1], ("b1".to_string(), None));
    }
}
