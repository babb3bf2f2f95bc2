use std::sync::Arc;

use kube::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::build::BuildIndex;
use crate::cluster::{Cluster, KubeCluster};
use crate::commit_status::{CommitStatusNotifier, LoggingCommitStatusNotifier};
use crate::config::ControllerConfig;
use crate::lifecycle::{ControllerStatus, Lifecycle};
use crate::manifest::{DefaultManifestRenderer, ManifestRenderer};
use crate::metrics::Metrics;
use crate::reconcile::{run_cleaner, run_initializer, run_stopper, run_undeployer, WakeSignals};
use crate::supervisor::supervise;
use crate::watchers::{run_deployment_watcher, run_job_watcher};

/// Diagnostics read by the web server: when the controller last observed any build
/// change.
#[derive(Clone)]
pub struct Diagnostics {
    pub last_build_event: chrono::DateTime<chrono::Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_build_event: chrono::Utc::now(),
        }
    }
}

/// Everything the HTTP server (`/health`, `/metrics`, status endpoints) needs, cloned
/// cheaply and handed to actix-web handlers as app data.
#[derive(Clone)]
pub struct State {
    pub index: Arc<BuildIndex>,
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: Arc<Metrics>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    pub fn metrics_text(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry).unwrap();
        buffer
    }

    pub fn controller_status(&self) -> ControllerStatus {
        self.lifecycle.controller_status()
    }
}

/// Owns the six long-running tasks (two watchers, four reconcilers) and the shared
/// state they operate on. `run` spawns every task under [`supervise`] and blocks until
/// shutdown is requested through `cancel`.
pub struct Controller {
    config: ControllerConfig,
    cluster: Arc<dyn Cluster>,
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    signals: Arc<WakeSignals>,
    state: State,
}

impl Controller {
    pub fn new(config: ControllerConfig, client: Client, metrics: Arc<Metrics>) -> Self {
        let cluster: Arc<dyn Cluster> =
            Arc::new(KubeCluster::new(client, config.build_namespace.clone()));
        Self::with_cluster(config, cluster, metrics)
    }

    /// Constructs a controller over any [`Cluster`] implementation, the seam tests use
    /// to plug in a fake.
    pub fn with_cluster(config: ControllerConfig, cluster: Arc<dyn Cluster>, metrics: Arc<Metrics>) -> Self {
        let index = Arc::new(BuildIndex::new());
        let notifier: Arc<dyn CommitStatusNotifier> = Arc::new(LoggingCommitStatusNotifier);
        let renderer: Arc<dyn ManifestRenderer> = Arc::new(DefaultManifestRenderer::new(
            config.build_namespace.clone(),
            config.build_domain.clone(),
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            cluster.clone(),
            index.clone(),
            notifier,
            renderer,
            config.clone(),
        ));
        let signals = Arc::new(WakeSignals::new());
        let listener: Arc<dyn crate::build::BuildEventListener + Send + Sync> = signals.clone();
        index.register_listener(&listener);

        let state = State {
            index: index.clone(),
            lifecycle: lifecycle.clone(),
            metrics,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
        };

        Self {
            config,
            cluster,
            index,
            lifecycle,
            signals,
            state,
        }
    }

    pub fn state(&self) -> State {
        self.state.clone()
    }

    /// Spawns every task and waits for them all. A cancellation on `cancel` (e.g. from
    /// a SIGTERM handler) makes every task return promptly; in-flight cluster calls are
    /// abandoned rather than awaited.
    pub async fn run(self, cancel: CancellationToken) {
        info!("starting controller tasks");
        let restart_delay = self.config.supervisor_restart_delay();

        let deployment_watcher = {
            let cluster = self.cluster.clone();
            let index = self.index.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("deployment-watcher", restart_delay, cancel, move || {
                let cluster = cluster.clone();
                let index = index.clone();
                Box::pin(async move { run_deployment_watcher(cluster, index).await })
            }))
        };

        let job_watcher = {
            let cluster = self.cluster.clone();
            let index = self.index.clone();
            let lifecycle = self.lifecycle.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("job-watcher", restart_delay, cancel, move || {
                let cluster = cluster.clone();
                let index = index.clone();
                let lifecycle = lifecycle.clone();
                Box::pin(async move { run_job_watcher(cluster, index, lifecycle).await })
            }))
        };

        let initializer = {
            let index = self.index.clone();
            let lifecycle = self.lifecycle.clone();
            let signal = self.signals.initializer.clone();
            let config = self.config.clone();
            let metrics = self.state.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("initializer", restart_delay, cancel.clone(), move || {
                let index = index.clone();
                let lifecycle = lifecycle.clone();
                let signal = signal.clone();
                let config = config.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                Box::pin(async move { run_initializer(index, lifecycle, signal, config, cancel, metrics).await })
            }))
        };

        let stopper = {
            let index = self.index.clone();
            let lifecycle = self.lifecycle.clone();
            let signal = self.signals.stopper.clone();
            let config = self.config.clone();
            let metrics = self.state.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("stopper", restart_delay, cancel.clone(), move || {
                let index = index.clone();
                let lifecycle = lifecycle.clone();
                let signal = signal.clone();
                let config = config.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                Box::pin(async move { run_stopper(index, lifecycle, signal, config, cancel, metrics).await })
            }))
        };

        let undeployer = {
            let index = self.index.clone();
            let lifecycle = self.lifecycle.clone();
            let signal = self.signals.undeployer.clone();
            let config = self.config.clone();
            let metrics = self.state.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("undeployer", restart_delay, cancel.clone(), move || {
                let index = index.clone();
                let lifecycle = lifecycle.clone();
                let signal = signal.clone();
                let config = config.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                Box::pin(async move { run_undeployer(index, lifecycle, signal, config, cancel, metrics).await })
            }))
        };

        let cleaner = {
            let index = self.index.clone();
            let lifecycle = self.lifecycle.clone();
            let signal = self.signals.cleaner.clone();
            let config = self.config.clone();
            let metrics = self.state.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(supervise("cleaner", restart_delay, cancel, move || {
                let index = index.clone();
                let lifecycle = lifecycle.clone();
                let signal = signal.clone();
                let config = config.clone();
                let metrics = metrics.clone();
                let cancel = cancel.clone();
                Box::pin(async move { run_cleaner(index, lifecycle, signal, config, cancel, metrics).await })
            }))
        };

        let _ = tokio::join!(
            deployment_watcher,
            job_watcher,
            initializer,
            stopper,
            undeployer,
            cleaner,
        );

        info!("all controller tasks drained");
    }
}
