use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tunnel_router_kernel::{
    Error, Firewall, FirewallRule, Links, NetNsRef, NextHop, PolicyRule, Result, Route, Routing,
    Tunnel,
};

/// A link created on the fake kernel.
#[derive(Clone, Debug)]
pub(crate) struct FakeLink {
    pub index: u32,
    pub tunnel: Tunnel,
    pub up: bool,
    pub addresses: Vec<Ipv4Addr>,
}

/// Namespace handle that counts itself as open until dropped.
#[derive(Debug)]
pub(crate) struct FakeNamespace {
    reference: NetNsRef,
    open: Arc<AtomicUsize>,
}

impl Drop for FakeNamespace {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

type LinkKey = (Option<NetNsRef>, String);

/// In-memory kernel recording everything the reconciler installs.
#[derive(Debug)]
pub(crate) struct FakeKernel {
    /// Rule specs per mangle chain, head first.
    pub chains: BTreeMap<String, Vec<String>>,
    pub routes: BTreeMap<(u32, Ipv4Addr), NextHop>,
    pub policy_rules: Vec<PolicyRule>,
    pub links: BTreeMap<LinkKey, FakeLink>,
    /// Namespaces that can be opened.
    pub namespaces: BTreeSet<NetNsRef>,
    pub open_handles: Arc<AtomicUsize>,
    /// Makes every route add fail with a command error.
    pub fail_routes: bool,
    /// Makes link creation inside namespaces fail with a command error.
    pub fail_namespace_links: bool,
    next_index: u32,
}

impl Default for FakeKernel {
    fn default() -> Self {
        let chains = ["PREROUTING", "OUTPUT"]
            .into_iter()
            .map(|c| (c.to_string(), vec![]))
            .collect();
        Self {
            chains,
            routes: BTreeMap::new(),
            policy_rules: vec![],
            links: BTreeMap::new(),
            namespaces: BTreeSet::new(),
            open_handles: Arc::new(AtomicUsize::new(0)),
            fail_routes: false,
            fail_namespace_links: false,
            next_index: 10,
        }
    }
}

impl FakeKernel {
    pub fn with_namespace(mut self, reference: &NetNsRef) -> Self {
        self.namespaces.insert(reference.clone());
        self
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn rules(&self, chain: &str) -> &[String] {
        self.chains.get(chain).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn route(&self, table: u32, destination: Ipv4Addr) -> Option<&NextHop> {
        self.routes.get(&(table, destination))
    }

    pub fn link(&self, netns: Option<&NetNsRef>, name: &str) -> Option<&FakeLink> {
        self.links.get(&(netns.cloned(), name.to_string()))
    }

    fn key(netns: Option<&FakeNamespace>, name: &str) -> LinkKey {
        (netns.map(|ns| ns.reference.clone()), name.to_string())
    }
}

impl Firewall for FakeKernel {
    fn ensure_chain(&mut self, chain: &str) -> Result<()> {
        self.chains.entry(chain.to_string()).or_default().clear();
        Ok(())
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        Ok(self.rules(&rule.chain).contains(&rule.spec))
    }

    fn insert_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        let rules = self
            .chains
            .get_mut(&rule.chain)
            .ok_or_else(|| Error::Iptables(format!("no chain {}", rule.chain)))?;
        if rules.contains(&rule.spec) {
            return Err(Error::AlreadyExists(rule.to_string()));
        }
        rules.insert(0, rule.spec.clone());
        Ok(())
    }

    fn delete_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        let rules = self
            .chains
            .get_mut(&rule.chain)
            .ok_or_else(|| Error::Iptables(format!("no chain {}", rule.chain)))?;
        let pos = rules
            .iter()
            .position(|s| *s == rule.spec)
            .ok_or_else(|| Error::NotFound(rule.to_string()))?;
        rules.remove(pos);
        Ok(())
    }
}

impl Routing for FakeKernel {
    fn add_route(&mut self, route: &Route) -> Result<()> {
        if self.fail_routes {
            return Err(Error::Command {
                command: format!("ip route add {route}"),
                stderr: "Network is unreachable".into(),
            });
        }
        let key = (route.table, route.destination);
        if self.routes.contains_key(&key) {
            return Err(Error::AlreadyExists(route.to_string()));
        }
        self.routes.insert(key, route.next_hop.clone());
        Ok(())
    }

    fn delete_route(&mut self, destination: Ipv4Addr, table: u32) -> Result<()> {
        self.routes
            .remove(&(table, destination))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("route {destination}/32 table {table}")))
    }

    fn flush_table(&mut self, table: u32) -> Result<()> {
        self.routes.retain(|(t, _), _| *t != table);
        Ok(())
    }

    fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<()> {
        if self.policy_rules.contains(&rule) {
            return Err(Error::AlreadyExists(format!(
                "rule fwmark {} table {}",
                rule.mark, rule.table
            )));
        }
        self.policy_rules.push(rule);
        Ok(())
    }
}

impl Links for FakeKernel {
    type Namespace = FakeNamespace;

    fn open_namespace(&mut self, reference: &NetNsRef) -> Result<FakeNamespace> {
        if !self.namespaces.contains(reference) {
            return Err(Error::NotFound(format!("network namespace {reference}")));
        }
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(FakeNamespace {
            reference: reference.clone(),
            open: self.open_handles.clone(),
        })
    }

    fn add_tunnel(&mut self, netns: Option<&FakeNamespace>, tunnel: &Tunnel) -> Result<()> {
        if self.fail_namespace_links && netns.is_some() {
            return Err(Error::Command {
                command: format!("ip link add {} type gre", tunnel.name),
                stderr: "Operation not permitted".into(),
            });
        }
        let key = Self::key(netns, &tunnel.name);
        if self.links.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("link {}", tunnel.name)));
        }
        self.next_index += 1;
        self.links.insert(
            key,
            FakeLink {
                index: self.next_index,
                tunnel: tunnel.clone(),
                up: false,
                addresses: vec![],
            },
        );
        Ok(())
    }

    fn add_address(
        &mut self,
        netns: Option<&FakeNamespace>,
        name: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        let link = self
            .links
            .get_mut(&Self::key(netns, name))
            .ok_or_else(|| Error::NotFound(format!("link {name}")))?;
        if link.addresses.contains(&address) {
            return Err(Error::AlreadyExists(format!("address {address}/32")));
        }
        link.addresses.push(address);
        Ok(())
    }

    fn set_up(&mut self, netns: Option<&FakeNamespace>, name: &str) -> Result<()> {
        let link = self
            .links
            .get_mut(&Self::key(netns, name))
            .ok_or_else(|| Error::NotFound(format!("link {name}")))?;
        link.up = true;
        Ok(())
    }

    fn link_index(&mut self, netns: Option<&FakeNamespace>, name: &str) -> Result<u32> {
        self.links
            .get(&Self::key(netns, name))
            .map(|l| l.index)
            .ok_or_else(|| Error::NotFound(format!("link {name}")))
    }

    fn delete_link(&mut self, netns: Option<&FakeNamespace>, name: &str) -> Result<()> {
        self.links
            .remove(&Self::key(netns, name))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("link {name}")))
    }

    fn link_names(&mut self, netns: Option<&FakeNamespace>) -> Result<Vec<String>> {
        let netns = netns.map(|ns| ns.reference.clone());
        Ok(self
            .links
            .keys()
            .filter(|(ns, _)| *ns == netns)
            .map(|(_, name)| name.clone())
            .collect())
    }
}
