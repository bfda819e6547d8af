use std::collections::BTreeSet;

use super::change::Change;
use super::state::{Endpoint, EndpointSnapshot, FilterState, Service, TunnelState};

/// Changes that make the filter state's services equal `desired`.
///
/// Removals come first so two rules never match the same tunnel IP while
/// an address moves between services.
pub fn service_changes(desired: &ahash::HashSet<Service>, filter: &FilterState) -> Vec<Change> {
    let mut removed: Vec<&Service> = filter.keys().filter(|s| !desired.contains(*s)).collect();
    let mut added: Vec<&Service> = desired.iter().filter(|s| !filter.contains_key(*s)).collect();
    removed.sort();
    added.sort();

    removed
        .into_iter()
        .map(|s| Change::ServiceRemoved(s.clone()))
        .chain(added.into_iter().map(|s| Change::ServiceAdded(s.clone())))
        .collect()
}

/// Changes that make the tracked endpoints equal `desired`.
///
/// Services that dropped out of the snapshot are drained and refreshed
/// first, and within a service removals precede additions. A service whose
/// tunnel IP moved shows up under both identities and both may name the
/// same interfaces, so the old identity's teardown must not follow the new
/// identity's setup. Each service ends with a single refresh, so the
/// refresh sees the final endpoint set.
pub fn endpoint_changes(desired: &EndpointSnapshot, tunnels: &TunnelState) -> Vec<Change> {
    let mut changes = vec![];

    let mut vanished: Vec<&Service> = tunnels.keys().filter(|s| !desired.contains_key(*s)).collect();
    vanished.sort();
    for service in vanished {
        for endpoint in tunnels[service].keys() {
            changes.push(Change::EndpointRemoved(service.clone(), endpoint.clone()));
        }
        changes.push(Change::EndpointsRefreshed(service.clone()));
    }

    let mut services: Vec<&Service> = desired.keys().collect();
    services.sort();
    for service in services {
        let wanted = &desired[service];
        let current: BTreeSet<&Endpoint> = tunnels
            .get(service)
            .map(|eps| eps.keys().collect())
            .unwrap_or_default();

        let added: Vec<&Endpoint> = wanted.iter().filter(|e| !current.contains(e)).collect();
        // the tracked endpoint is used so its namespace reference survives
        let removed: Vec<&Endpoint> = current
            .iter()
            .copied()
            .filter(|e| !wanted.contains(*e))
            .collect();
        if added.is_empty() && removed.is_empty() {
            continue;
        }

        for endpoint in removed {
            changes.push(Change::EndpointRemoved(service.clone(), endpoint.clone()));
        }
        for endpoint in added {
            changes.push(Change::EndpointAdded(service.clone(), endpoint.clone()));
        }
        changes.push(Change::EndpointsRefreshed(service.clone()));
    }

    changes
}

/// Appends a refresh for each service in `pending` that `changes` does not
/// refresh already. A refresh that failed part way is not visible in the
/// tracked state, so it has to be carried into the next cycle.
pub fn with_pending_refreshes(
    mut changes: Vec<Change>,
    pending: &ahash::HashSet<Service>,
) -> Vec<Change> {
    let mut missing: Vec<&Service> = pending
        .iter()
        .filter(|s| {
            !changes
                .iter()
                .any(|c| matches!(c, Change::EndpointsRefreshed(r) if r == *s))
        })
        .collect();
    missing.sort();
    changes.extend(missing.into_iter().map(|s| Change::EndpointsRefreshed(s.clone())));
    changes
}
