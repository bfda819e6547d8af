use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::reconcile::CycleOutcome;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("tunnel_router")));

/// Text exposition of everything registered so far.
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(()) => buffer,
        Err(_) => String::new(),
    }
}

/// Reconciler metrics. `Default` builds them unregistered, for tests and
/// for callers that do not export them.
#[derive(Clone)]
pub struct ReconcileMetrics {
    pub cycles: Family<CycleLabels, Counter>,
    pub changes: Family<ChangeLabels, Counter>,
    pub duration: Histogram,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            cycles: Family::default(),
            changes: Family::default(),
            duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    /// Register reconciler metrics to start tracking them.
    pub fn new() -> Self {
        let metrics = Self::default();
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        registry.register_with_unit(
            "reconcile_duration",
            "Duration of a reconciliation cycle",
            Unit::Seconds,
            metrics.duration.clone(),
        );
        registry.register(
            "reconcile_cycles",
            "Number of reconciliation cycles by outcome",
            metrics.cycles.clone(),
        );
        registry.register(
            "reconcile_changes",
            "Number of applied changes by kind",
            metrics.changes.clone(),
        );
        metrics
    }

    pub fn count_change(&self, kind: &str) {
        self.changes
            .get_or_create(&ChangeLabels { kind: kind.into() })
            .inc();
    }

    pub fn count_outcome(&self, outcome: &CycleOutcome) {
        self.cycles
            .get_or_create(&CycleLabels {
                outcome: outcome.label(),
            })
            .inc();
    }

    pub fn measure(&self) -> CycleMeasurer {
        CycleMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

/// Observes the elapsed time of a cycle when dropped.
pub struct CycleMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for CycleMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CycleLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChangeLabels {
    pub kind: String,
}
