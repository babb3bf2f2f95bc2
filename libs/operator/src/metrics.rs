use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::build::BuildStatus;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub builds: BuildMetrics,
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Builds on top of a registry the caller may already have registered other
    /// metrics into (the Kubernetes client's HTTP metrics, notably).
    pub fn new(mut registry: Registry) -> Self {
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let builds = BuildMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
            builds,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(Registry::with_prefix("runboat"))
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

fn trace_label(id: &TraceId) -> Option<TraceLabel> {
    if std::matches!(id, &TraceId::INVALID) {
        None
    } else {
        Some(TraceLabel { id: id.to_string() })
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcilerLabel {
    pub reconciler: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcilerErrorLabels {
    pub reconciler: String,
    pub build: String,
    pub error: String,
}

/// Per-reconciler pass counters and timings: one `count_and_measure` call wraps the
/// dispatch loop of a single initializer/stopper/undeployer/cleaner pass.
#[derive(Clone)]
pub struct ReconcileMetrics {
    pub passes: Family<ReconcilerLabel, Counter>,
    pub actions: Family<ReconcilerLabel, Counter>,
    pub failures: Family<ReconcilerErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            passes: Family::<ReconcilerLabel, Counter>::default(),
            actions: Family::<ReconcilerLabel, Counter>::default(),
            failures: Family::<ReconcilerErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconciler pass duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register("reconcile_passes", "reconciler passes", self.passes.clone());
        r.register(
            "reconcile_actions",
            "actions dispatched by a reconciler",
            self.actions.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciler action failures",
            self.failures.clone(),
        );
        self
    }

    pub fn set_failure(&self, reconciler: &str, build: &str, error: &crate::error::Error) {
        self.failures
            .get_or_create(&ReconcilerErrorLabels {
                reconciler: reconciler.to_string(),
                build: build.to_string(),
                error: error.to_string(),
            })
            .inc();
    }

    pub fn record_action(&self, reconciler: &str) {
        self.actions
            .get_or_create(&ReconcilerLabel {
                reconciler: reconciler.to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, reconciler: &str, trace_id: &TraceId) -> ReconcileMeasurer {
        self.passes
            .get_or_create(&ReconcilerLabel {
                reconciler: reconciler.to_string(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_label(trace_id),
            metric: self.duration.clone(),
        }
    }
}

/// Relies on `Drop` to calculate duration and register the observation.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: String,
}

/// Fleet-wide gauges, refreshed from the index snapshot on every scrape.
#[derive(Clone)]
pub struct BuildMetrics {
    pub by_status: Family<StatusLabel, Gauge>,
    pub total: Gauge,
}

impl Default for BuildMetrics {
    fn default() -> Self {
        Self {
            by_status: Family::<StatusLabel, Gauge>::default(),
            total: Gauge::default(),
        }
    }
}

impl BuildMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "builds_by_status",
            "tracked builds by derived status",
            self.by_status.clone(),
        );
        r.register("builds_total", "all tracked builds", self.total.clone());
        self
    }

    pub fn observe(&self, index: &crate::build::BuildIndex) {
        self.total.set(index.count_all() as i64);
        for status in [
            BuildStatus::Stopped,
            BuildStatus::Stopping,
            BuildStatus::Initializing,
            BuildStatus::Starting,
            BuildStatus::Started,
            BuildStatus::Failed,
            BuildStatus::Undeploying,
        ] {
            self.by_status
                .get_or_create(&StatusLabel {
                    status: format!("{status:?}").to_lowercase(),
                })
                .set(index.count_by_status(status) as i64);
        }
    }
}
