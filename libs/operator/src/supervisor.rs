use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

type BoxedTask = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Runs `task` until it returns or `cancel` fires; if it returns an error, logs it and
/// re-enters after `restart_delay`. A long-running task that is never allowed to die
/// silently.
pub async fn supervise(
    name: &'static str,
    restart_delay: Duration,
    cancel: CancellationToken,
    mut make_task: impl FnMut() -> BoxedTask,
) {
    loop {
        if cancel.is_cancelled() {
            info!(task = name, "shutting down");
            return;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = name, "shutting down");
                return;
            }
            result = make_task() => result,
        };

        match result {
            Ok(()) => {
                warn!(task = name, "task returned without error, restarting");
            }
            Err(err) => {
                error!(task = name, error = %err, "task failed, restarting after backoff");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = name, "shutting down during backoff");
                return;
            }
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}
