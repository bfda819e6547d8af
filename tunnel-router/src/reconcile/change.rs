use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};
use tunnel_router_kernel::{
    Firewall, FirewallRule, Interface, Links, NextHop, Route, Routing, Tunnel, host_tunnel_name,
    namespace_tunnel_name, tolerate_exists, tolerate_missing,
};

use super::state::{Endpoint, Service, State};
use crate::config::{Encapsulation, RoutingConfig};
use crate::{Error, Result};

/// One step towards the desired state. Each variant touches either the
/// filter state or the tunnel state, never both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    ServiceAdded(Service),
    ServiceRemoved(Service),
    EndpointAdded(Service, Endpoint),
    EndpointRemoved(Service, Endpoint),
    EndpointsRefreshed(Service),
}

impl Change {
    pub fn kind(&self) -> &'static str {
        match self {
            Change::ServiceAdded(_) => "service_added",
            Change::ServiceRemoved(_) => "service_removed",
            Change::EndpointAdded(..) => "endpoint_added",
            Change::EndpointRemoved(..) => "endpoint_removed",
            Change::EndpointsRefreshed(_) => "endpoints_refreshed",
        }
    }

    pub fn service(&self) -> &Service {
        match self {
            Change::ServiceAdded(s)
            | Change::ServiceRemoved(s)
            | Change::EndpointAdded(s, _)
            | Change::EndpointRemoved(s, _)
            | Change::EndpointsRefreshed(s) => s,
        }
    }

    pub fn apply<K>(&self, state: &mut State, kernel: &mut K, config: &RoutingConfig) -> Result<()>
    where
        K: Firewall + Routing + Links,
    {
        info!(change = %self, "applying");
        match self {
            Change::ServiceAdded(service) => add_service(state, kernel, config, service),
            Change::ServiceRemoved(service) => remove_service(state, kernel, service),
            Change::EndpointAdded(service, endpoint) => {
                add_endpoint(state, kernel, config, service, endpoint)
            }
            Change::EndpointRemoved(service, endpoint) => {
                remove_endpoint(state, kernel, service, endpoint)
            }
            Change::EndpointsRefreshed(service) => refresh_endpoints(state, kernel, config, service),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::ServiceAdded(s) => write!(f, "add service {s}"),
            Change::ServiceRemoved(s) => write!(f, "remove service {s}"),
            Change::EndpointAdded(s, e) => write!(f, "add endpoint {e} to {s}"),
            Change::EndpointRemoved(s, e) => write!(f, "remove endpoint {e} from {s}"),
            Change::EndpointsRefreshed(s) => write!(f, "refresh endpoints of {s}"),
        }
    }
}

/// Filter rule sending traffic for the service's tunnel IP to the marking
/// chain.
pub fn filter_rule(config: &RoutingConfig, service: &Service) -> FirewallRule {
    FirewallRule::new(
        config.filter_chain.as_str(),
        format!(
            "-d {}/32 -m comment --comment tunnel-router:{}/{} -j {}",
            service.tunnel_ip, service.namespace, service.name, config.ingress_chain
        ),
    )
}

fn add_service<K: Firewall>(
    state: &mut State,
    kernel: &mut K,
    config: &RoutingConfig,
    service: &Service,
) -> Result<()> {
    let rule = filter_rule(config, service);
    match kernel.insert_rule(&rule) {
        Ok(()) => {}
        // a rule we are not tracking means the kernel drifted from our state
        Err(e) if e.is_already_exists() => return Err(Error::RuleExists(service.to_string())),
        Err(e) => return Err(e.into()),
    }
    state.filter.insert(service.clone(), rule);
    Ok(())
}

fn remove_service<K: Firewall>(state: &mut State, kernel: &mut K, service: &Service) -> Result<()> {
    let rule = state
        .filter
        .get(service)
        .ok_or_else(|| Error::Invariant(format!("no filter rule recorded for {service}")))?;
    tolerate_missing(kernel.delete_rule(rule))?;
    state.filter.remove(service);
    Ok(())
}

fn add_endpoint<K: Links>(
    state: &mut State,
    kernel: &mut K,
    config: &RoutingConfig,
    service: &Service,
    endpoint: &Endpoint,
) -> Result<()> {
    let interfaces = match config.mode {
        Encapsulation::Mpls => vec![],
        Encapsulation::Gre => create_tunnels(kernel, config, service, endpoint)?,
    };
    state
        .tunnels
        .entry(service.clone())
        .or_default()
        .insert(endpoint.clone(), interfaces);
    Ok(())
}

fn create_tunnels<K: Links>(
    kernel: &mut K,
    config: &RoutingConfig,
    service: &Service,
    endpoint: &Endpoint,
) -> Result<Vec<Interface>> {
    // released when this function returns, whichever way it does
    let netns = endpoint
        .netns
        .as_ref()
        .map(|reference| kernel.open_namespace(reference))
        .transpose()?;

    let host = Tunnel {
        name: host_tunnel_name(&config.tunnel_prefix, endpoint.ip)?,
        remote: endpoint.ip,
        local: config.node_ip,
    };
    let (index, host_created) = ensure_tunnel(kernel, None, &host, None)?;
    let mut interfaces = vec![Interface {
        index,
        name: host.name.clone(),
        internal: false,
    }];

    if let Some(netns) = &netns {
        match namespace_tunnel(kernel, netns, config, service, endpoint) {
            Ok(interface) => interfaces.push(interface),
            Err(e) => {
                // nothing gets recorded, so nothing else would remove it
                if host_created {
                    discard_tunnel(kernel, None, &host.name);
                }
                return Err(e);
            }
        }
    }

    Ok(interfaces)
}

/// The tunnel end inside the backend's namespace, holding the tunnel IP.
fn namespace_tunnel<K: Links>(
    kernel: &mut K,
    netns: &K::Namespace,
    config: &RoutingConfig,
    service: &Service,
    endpoint: &Endpoint,
) -> Result<Interface> {
    let node_ip = config
        .node_ip
        .ok_or_else(|| Error::InvalidConfig("gre mode requires the node address".into()))?;
    let inner = Tunnel {
        name: namespace_tunnel_name(&config.tunnel_prefix, &service.name)?,
        remote: node_ip,
        local: Some(endpoint.ip),
    };
    let (index, _) = ensure_tunnel(kernel, Some(netns), &inner, Some(service.tunnel_ip))?;
    Ok(Interface {
        index,
        name: inner.name,
        internal: true,
    })
}

/// Creates, addresses and raises a tunnel, reusing whatever already exists.
/// Returns the link index and whether the link was created by this call. A
/// link created here is deleted again when a later step fails.
fn ensure_tunnel<K: Links>(
    kernel: &mut K,
    netns: Option<&K::Namespace>,
    tunnel: &Tunnel,
    address: Option<Ipv4Addr>,
) -> Result<(u32, bool)> {
    let created = match kernel.add_tunnel(netns, tunnel) {
        Ok(()) => true,
        Err(e) if e.is_already_exists() => false,
        Err(e) => return Err(e.into()),
    };
    match configure_tunnel(kernel, netns, tunnel, address) {
        Ok(index) => Ok((index, created)),
        Err(e) => {
            if created {
                discard_tunnel(kernel, netns, &tunnel.name);
            }
            Err(e)
        }
    }
}

fn configure_tunnel<K: Links>(
    kernel: &mut K,
    netns: Option<&K::Namespace>,
    tunnel: &Tunnel,
    address: Option<Ipv4Addr>,
) -> Result<u32> {
    if let Some(address) = address {
        tolerate_exists(kernel.add_address(netns, &tunnel.name, address))?;
    }
    kernel.set_up(netns, &tunnel.name)?;
    let index = kernel.link_index(netns, &tunnel.name)?;
    debug!(name = %tunnel.name, index, remote = %tunnel.remote, "tunnel ready");
    Ok(index)
}

fn discard_tunnel<K: Links>(kernel: &mut K, netns: Option<&K::Namespace>, name: &str) {
    if let Err(e) = tolerate_missing(kernel.delete_link(netns, name)) {
        warn!(%e, name, "failed to delete partially created tunnel");
    }
}

/// True when an entry other than `(service, endpoint)` records the
/// interface. Host tunnels are named after the peer, so services sharing a
/// backend share its host tunnel.
fn in_use_elsewhere(
    state: &State,
    service: &Service,
    endpoint: &Endpoint,
    interface: &Interface,
) -> bool {
    state.tunnels.iter().any(|(s, endpoints)| {
        endpoints.iter().any(|(e, interfaces)| {
            (s != service || e != endpoint)
                && (!interface.internal || e.netns == endpoint.netns)
                && interfaces
                    .iter()
                    .any(|i| i.name == interface.name && i.internal == interface.internal)
        })
    })
}

fn remove_endpoint<K: Links>(
    state: &mut State,
    kernel: &mut K,
    service: &Service,
    endpoint: &Endpoint,
) -> Result<()> {
    let tracked: &State = state;
    let interfaces: Vec<Interface> = tracked
        .tunnels
        .get(service)
        .and_then(|eps| eps.get(endpoint))
        .ok_or_else(|| Error::Invariant(format!("endpoint {endpoint} of {service} not tracked")))?
        .iter()
        .filter(|i| !in_use_elsewhere(tracked, service, endpoint, i))
        .cloned()
        .collect();

    let netns = match &endpoint.netns {
        Some(reference) if interfaces.iter().any(|i| i.internal) => {
            match kernel.open_namespace(reference) {
                Ok(netns) => Some(netns),
                Err(e) if e.is_not_found() => {
                    debug!(%reference, "namespace is gone, skipping its interfaces");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        }
        _ => None,
    };

    for interface in &interfaces {
        if interface.internal {
            if let Some(netns) = &netns {
                tolerate_missing(kernel.delete_link(Some(netns), &interface.name))?;
            }
        } else {
            tolerate_missing(kernel.delete_link(None, &interface.name))?;
        }
    }
    drop(netns);

    if let Some(endpoints) = state.tunnels.get_mut(service) {
        endpoints.remove(endpoint);
        if endpoints.is_empty() {
            state.tunnels.remove(service);
        }
    }
    Ok(())
}

fn refresh_endpoints<K: Routing>(
    state: &mut State,
    kernel: &mut K,
    config: &RoutingConfig,
    service: &Service,
) -> Result<()> {
    for table in config.tables() {
        tolerate_missing(kernel.delete_route(service.tunnel_ip, table))?;
    }

    // TODO: spread buckets across endpoints instead of routing all of them
    // to the first one
    let target = state
        .tunnels
        .get(service)
        .and_then(|eps| eps.iter().next())
        .map(|(endpoint, interfaces)| (endpoint.clone(), interfaces.clone()));
    let Some((endpoint, interfaces)) = target else {
        debug!(%service, "no endpoints left, routing removed");
        state.tunnels.remove(service);
        return Ok(());
    };

    let next_hop = match config.mode {
        Encapsulation::Mpls => NextHop::Mpls {
            gateway: endpoint.ip,
            label: config.mpls_label,
        },
        Encapsulation::Gre => interfaces
            .iter()
            .find(|i| !i.internal)
            .map(|i| NextHop::Device(i.name.clone()))
            .ok_or_else(|| {
                Error::Invariant(format!("endpoint {endpoint} of {service} has no host tunnel"))
            })?,
    };

    for table in config.tables() {
        kernel.add_route(&Route {
            destination: service.tunnel_ip,
            table,
            next_hop: next_hop.clone(),
        })?;
    }
    debug!(%service, %endpoint, "routing all buckets to endpoint");
    Ok(())
}
