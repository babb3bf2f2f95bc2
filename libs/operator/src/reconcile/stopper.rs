use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::wait_and_debounce;
use crate::build::{BuildIndex, BuildStatus};
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::lifecycle::Lifecycle;
use crate::metrics::Metrics;
use crate::telemetry;

const RECONCILER: &str = "stopper";

/// Stops the oldest-by-`last_scaled` started builds, bounded by
/// `max_started - count_by_status(started)`.
pub async fn run_stopper(
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

        let current = index.count_by_status(BuildStatus::Started);
        let headroom = config.max_started.saturating_sub(current);
        if headroom == 0 {
            continue;
        }

        for build in index.oldest_started().into_iter().take(headroom) {
            metrics.reconcile.record_action(RECONCILER);
            if let Err(err) = lifecycle.stop(&build).await {
                metrics.reconcile.set_failure(RECONCILER, &build.name, &err);
                warn!(build = %build.name, error = %err, "stop() failed, will reconsider next pass");
            }
        }
    }
}
