mod change;
mod diff;
#[cfg(test)]
pub(crate) mod fake;
mod state;

use std::time::Duration;

pub use change::{Change, filter_rule};
pub use diff::{endpoint_changes, service_changes};
pub use state::{
    Endpoint, EndpointInterfaces, EndpointSnapshot, FilterState, Service, State, TunnelState,
};

use tokio::task::block_in_place;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnel_router_kernel::{Firewall, Links, Routing};

use crate::config::RoutingConfig;
use crate::kubernetes::DesiredState;
use crate::metrics::ReconcileMetrics;
use crate::{Error, Result, Severity};

/// How a single reconciliation cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    Converged { changes: usize },
    /// The rest of the cycle was skipped; the next one starts over.
    TransientFailure(Error),
    FatalFailure(Error),
}

impl CycleOutcome {
    fn from_result(res: Result<usize>) -> Self {
        match res {
            Ok(changes) => CycleOutcome::Converged { changes },
            Err(e) => match e.severity() {
                Severity::Transient => CycleOutcome::TransientFailure(e),
                Severity::Fatal => CycleOutcome::FatalFailure(e),
            },
        }
    }

    pub fn label(&self) -> String {
        match self {
            CycleOutcome::Converged { .. } => "converged".into(),
            CycleOutcome::TransientFailure(_) => "transient_failure".into(),
            CycleOutcome::FatalFailure(_) => "fatal_failure".into(),
        }
    }
}

/// Owns the state maps and the kernel handles. Only one cycle runs at a
/// time, so neither needs locking.
pub struct Reconciler<K> {
    state: State,
    kernel: K,
    config: RoutingConfig,
    metrics: ReconcileMetrics,
    /// Services whose routing refresh failed or was skipped by an earlier
    /// failure. Their routes may be gone while the tracked endpoints are
    /// already current.
    pending_refresh: ahash::HashSet<Service>,
}

impl<K> Reconciler<K>
where
    K: Firewall + Routing + Links,
{
    pub fn new(kernel: K, config: RoutingConfig, metrics: ReconcileMetrics) -> Self {
        Self {
            state: State::default(),
            kernel,
            config,
            metrics,
            pending_refresh: ahash::HashSet::default(),
        }
    }

    /// Applies changes in order, stopping at the first failure. Refreshes
    /// that did not complete are remembered for the next cycle.
    pub fn enact(&mut self, changes: &[Change]) -> Result<()> {
        for (i, change) in changes.iter().enumerate() {
            if let Err(e) = change.apply(&mut self.state, &mut self.kernel, &self.config) {
                for skipped in &changes[i..] {
                    if let Change::EndpointsRefreshed(service) = skipped {
                        self.pending_refresh.insert(service.clone());
                    }
                }
                return Err(e);
            }
            if let Change::EndpointsRefreshed(service) = change {
                self.pending_refresh.remove(service);
            }
            self.metrics.count_change(change.kind());
        }
        Ok(())
    }

    pub async fn cycle<S: DesiredState>(&mut self, source: &S) -> CycleOutcome {
        let _measure = self.metrics.measure();
        let outcome = CycleOutcome::from_result(self.try_cycle(source).await);
        self.metrics.count_outcome(&outcome);
        outcome
    }

    async fn try_cycle<S: DesiredState>(&mut self, source: &S) -> Result<usize> {
        let desired = source.services().await?;
        let changes = service_changes(&desired, &self.state.filter);
        let mut total = changes.len();
        block_in_place(|| self.enact(&changes))?;

        let managed: ahash::HashSet<Service> = self.state.filter.keys().cloned().collect();
        let endpoints = source.endpoints(&managed).await?;
        let changes = diff::with_pending_refreshes(
            endpoint_changes(&endpoints, &self.state.tunnels),
            &self.pending_refresh,
        );
        if !self.pending_refresh.is_empty() {
            debug!(pending = self.pending_refresh.len(), "retrying routing refresh");
        }
        total += changes.len();
        block_in_place(|| self.enact(&changes))?;

        Ok(total)
    }
}

/// Runs cycles until cancelled, idling `interval` between them. Returns an
/// error only when a cycle fails fatally.
pub async fn run<K, S>(
    source: S,
    mut reconciler: Reconciler<K>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    K: Firewall + Routing + Links,
    S: DesiredState,
{
    info!(?interval, "starting reconciliation");
    loop {
        match reconciler.cycle(&source).await {
            CycleOutcome::Converged { changes: 0 } => {}
            CycleOutcome::Converged { changes } => debug!(changes, "cycle converged"),
            CycleOutcome::TransientFailure(e) => {
                warn!(error = %e, kind = e.metric_label(), "cycle failed, retrying next cycle")
            }
            CycleOutcome::FatalFailure(e) => {
                error!(error = %e, "cycle failed fatally");
                return Err(e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("reconciliation stopped");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
