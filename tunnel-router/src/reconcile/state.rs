use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use tunnel_router_kernel::{FirewallRule, Interface, NetNsRef};

/// An annotated service. A new tunnel IP makes it a different service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub tunnel_ip: Ipv4Addr,
}

impl Service {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, tunnel_ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            tunnel_ip,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.namespace, self.name, self.tunnel_ip)
    }
}

/// A backend address, identified by its IP alone.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    /// Set when the backend runs on this host in a namespace we can enter.
    pub netns: Option<NetNsRef>,
}

impl Endpoint {
    pub fn remote(ip: Ipv4Addr) -> Self {
        Self { ip, netns: None }
    }

    pub fn local(ip: Ipv4Addr, netns: NetNsRef) -> Self {
        Self {
            ip,
            netns: Some(netns),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip.cmp(&other.ip)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.netns {
            Some(netns) => write!(f, "{} (netns {})", self.ip, netns),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Installed filter rule per service.
pub type FilterState = ahash::HashMap<Service, FirewallRule>;

/// Tunnel interfaces per endpoint of one service.
pub type EndpointInterfaces = BTreeMap<Endpoint, Vec<Interface>>;

/// Tracked endpoints per service. A service is only present while it has
/// at least one endpoint.
pub type TunnelState = ahash::HashMap<Service, EndpointInterfaces>;

/// Desired backends per managed service.
pub type EndpointSnapshot = ahash::HashMap<Service, BTreeSet<Endpoint>>;

/// Everything the reconciler remembers between cycles.
#[derive(Debug, Default)]
pub struct State {
    pub filter: FilterState,
    pub tunnels: TunnelState,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_endpoint_identity_is_ip() {
        let ip = Ipv4Addr::new(10, 1, 1, 2);
        let remote = Endpoint::remote(ip);
        let local = Endpoint::local(ip, NetNsRef::new("/var/run/netns/default_web-0"));
        assert_eq!(remote, local);

        let mut set = BTreeSet::new();
        set.insert(local);
        assert!(!set.insert(remote));
        assert!(set.iter().next().unwrap().netns.is_some());
    }

    #[test]
    fn test_service_identity_includes_tunnel_ip() {
        let a = Service::new("web", "default", Ipv4Addr::new(10, 0, 0, 5));
        let b = Service::new("web", "default", Ipv4Addr::new(10, 0, 0, 6));
        assert_ne!(a, b);
    }
}
