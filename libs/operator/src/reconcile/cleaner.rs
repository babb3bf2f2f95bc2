use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::wait_and_debounce;
use crate::build::BuildIndex;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::telemetry;

const RECONCILER: &str = "cleaner";

/// Unbounded: every build currently `undeploying` gets its cleanup job (re-)applied.
/// Also the one reconciler guaranteed to run every pass regardless of capacity, so it
/// doubles as the spot that refreshes the fleet-wide build gauges.
pub async fn run_cleaner(
    index: Arc<BuildIndex>,
    lifecycle: Arc<Lifecycle>,
    signal: Arc<Notify>,
    config: ControllerConfig,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = wait_and_debounce(&signal, config.event_buffering_delay(), config.reconciler_max_wait()) => {}
        }

        let _timer = metrics
            .reconcile
            .count_and_measure(RECONCILER, &telemetry::get_trace_id());
        metrics.builds.observe(&index);

        for build in index.to_cleanup() {
            metrics.reconcile.record_action(RECONCILER);
            if let Err(err) = lifecycle.cleanup(&build).await {
                metrics.reconcile.set_failure(RECONCILER, &build.name, &err);
                warn!(build = %build.name, error = %err, "cleanup() failed, will reconsider next pass");
            }
        }
    }
}
