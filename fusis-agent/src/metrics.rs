use std::sync::{LazyLock, PoisonError, RwLock};

use fusis_nat::Pass;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::Error;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("fusis_agent")));

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
    pub desired: Gauge,
    pub added: Counter,
    pub removed: Counter,
}

impl Default for ReconcileMetrics {
    /// Registers the reconcile metrics in the global [`REGISTRY`].
    fn default() -> Self {
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        Self::register(&mut registry)
    }
}

impl ReconcileMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let runs = Counter::default();
        let failures = Family::<ErrorLabels, Counter>::default();
        let duration = Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter());
        let desired = Gauge::default();
        let added = Counter::default();
        let removed = Counter::default();

        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            failures.clone(),
        );
        registry.register("reconcile_runs", "Number of reconciliations", runs.clone());
        registry.register(
            "desired_sources",
            "Number of addresses in the last desired set",
            desired.clone(),
        );
        registry.register("marks_added", "Number of mark rules added", added.clone());
        registry.register(
            "marks_removed",
            "Number of mark rules removed",
            removed.clone(),
        );
        Self {
            runs,
            failures,
            duration,
            desired,
            added,
            removed,
        }
    }

    pub fn count_failure(&self, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, desired: usize) -> ReconcileMeasurer {
        self.runs.inc();
        self.desired.set(i64::try_from(desired).unwrap_or(i64::MAX));
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }

    pub fn record_pass(&self, pass: &Pass) {
        self.added.inc_by(pass.added.len() as u64);
        self.removed.inc_by(pass.removed.len() as u64);
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub error: String,
}
