use std::time::Duration;

use clap::Parser;

/// Controller configuration, loaded from CLI flags (and, through `clap`'s env
/// fallback, from `RUNBOAT_*` environment variables) the same way `cmd/operator`
/// wires up every other setting.
#[derive(Parser, Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace builds are created in and watched within.
    #[arg(long, env = "RUNBOAT_BUILD_NAMESPACE")]
    pub build_namespace: String,

    /// Base domain builds are exposed under; a build's externally reachable host is
    /// `<slug>.<build_domain>`.
    #[arg(long, env = "RUNBOAT_BUILD_DOMAIN")]
    pub build_domain: String,

    /// Maximum number of builds concurrently running an initialize job.
    #[arg(long, env = "RUNBOAT_MAX_INITIALIZING", default_value_t = 2)]
    pub max_initializing: usize,

    /// Maximum number of builds with `status = started` at once.
    #[arg(long, env = "RUNBOAT_MAX_STARTED", default_value_t = 6)]
    pub max_started: usize,

    /// Maximum number of builds deployed at all (started, starting, stopping, stopped,
    /// failed, initializing -- anything short of undeploying).
    #[arg(long, env = "RUNBOAT_MAX_DEPLOYED", default_value_t = 10)]
    pub max_deployed: usize,

    /// Debounce window a reconciler sleeps after waking before re-evaluating capacity.
    #[arg(long, env = "RUNBOAT_EVENT_BUFFERING_DELAY_SECS", default_value_t = 1)]
    pub event_buffering_delay_secs: u64,

    /// Upper bound on how long a reconciler waits without any wake-up, guarding
    /// against a watcher that stalls without erroring.
    #[arg(long, env = "RUNBOAT_RECONCILER_MAX_WAIT_SECS", default_value_t = 10)]
    pub reconciler_max_wait_secs: u64,

    /// Delay the supervisor waits before restarting a failed watcher or reconciler.
    #[arg(long, env = "RUNBOAT_SUPERVISOR_RESTART_DELAY_SECS", default_value_t = 5)]
    pub supervisor_restart_delay_secs: u64,
}

impl ControllerConfig {
    pub fn event_buffering_delay(&self) -> Duration {
        Duration::from_secs(self.event_buffering_delay_secs)
    }

    pub fn reconciler_max_wait(&self) -> Duration {
        Duration::from_secs(self.reconciler_max_wait_secs)
    }

    pub fn supervisor_restart_delay(&self) -> Duration {
        Duration::from_secs(self.supervisor_restart_delay_secs)
    }
}
