mod cleaner;
mod initializer;
mod stopper;
mod undeployer;

pub use cleaner::run_cleaner;
pub use initializer::run_initializer;
pub use stopper::run_stopper;
pub use undeployer::run_undeployer;

use std::sync::Arc;

use tokio::sync::Notify;

use crate::build::{BuildEvent, BuildEventListener};

/// One edge-triggered wake signal per reconciler. `index.add`/`remove` notifies all
/// four unconditionally; each reconciler then debounces on its own.
pub struct WakeSignals {
    pub initializer: Arc<Notify>,
    pub stopper: Arc<Notify>,
    pub undeployer: Arc<Notify>,
    pub cleaner: Arc<Notify>,
}

impl WakeSignals {
    pub fn new() -> Self {
        Self {
            initializer: Arc::new(Notify::new()),
            stopper: Arc::new(Notify::new()),
            undeployer: Arc::new(Notify::new()),
            cleaner: Arc::new(Notify::new()),
        }
    }
}

impl Default for WakeSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildEventListener for WakeSignals {
    fn on_build_event(&self, _event: &BuildEvent) {
        self.initializer.notify_one();
        self.stopper.notify_one();
        self.undeployer.notify_one();
        self.cleaner.notify_one();
    }
}

/// Waits for `signal`, then sleeps `debounce` before returning, coalescing any bursts
/// that arrive during the sleep window. A periodic floor (`max_wait`) protects against
/// a watcher that stalls without erroring.
pub(crate) async fn wait_and_debounce(signal: &Notify, debounce: std::time::Duration, max_wait: std::time::Duration) {
    let _ = tokio::time::timeout(max_wait, signal.notified()).await;
    tokio::time::sleep(debounce).await;
}
