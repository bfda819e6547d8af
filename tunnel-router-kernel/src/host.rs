use std::net::Ipv4Addr;

use crate::command::IpRoute2;
use crate::firewall::{Firewall, FirewallRule, IptablesFirewall};
use crate::link::{Links, Tunnel};
use crate::netns::{Namespace, NetNsRef};
use crate::route::{PolicyRule, Route, Routing};
use crate::Result;

/// The production kernel: iptables for filtering, iproute2 for the rest.
pub struct Host {
    firewall: IptablesFirewall,
    ip: IpRoute2,
}

impl Host {
    pub fn try_new() -> Result<Self> {
        Ok(Self {
            firewall: IptablesFirewall::try_new()?,
            ip: IpRoute2::default(),
        })
    }
}

impl Firewall for Host {
    fn ensure_chain(&mut self, chain: &str) -> Result<()> {
        self.firewall.ensure_chain(chain)
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        self.firewall.rule_exists(rule)
    }

    fn insert_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        self.firewall.insert_rule(rule)
    }

    fn delete_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        self.firewall.delete_rule(rule)
    }
}

impl Routing for Host {
    fn add_route(&mut self, route: &Route) -> Result<()> {
        self.ip.add_route(route)
    }

    fn delete_route(&mut self, destination: Ipv4Addr, table: u32) -> Result<()> {
        self.ip.delete_route(destination, table)
    }

    fn flush_table(&mut self, table: u32) -> Result<()> {
        self.ip.flush_table(table)
    }

    fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<()> {
        self.ip.add_policy_rule(rule)
    }
}

impl Links for Host {
    type Namespace = Namespace;

    fn open_namespace(&mut self, reference: &NetNsRef) -> Result<Namespace> {
        self.ip.open_namespace(reference)
    }

    fn add_tunnel(&mut self, netns: Option<&Namespace>, tunnel: &Tunnel) -> Result<()> {
        self.ip.add_tunnel(netns, tunnel)
    }

    fn add_address(
        &mut self,
        netns: Option<&Namespace>,
        name: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        self.ip.add_address(netns, name, address)
    }

    fn set_up(&mut self, netns: Option<&Namespace>, name: &str) -> Result<()> {
        self.ip.set_up(netns, name)
    }

    fn link_index(&mut self, netns: Option<&Namespace>, name: &str) -> Result<u32> {
        self.ip.link_index(netns, name)
    }

    fn delete_link(&mut self, netns: Option<&Namespace>, name: &str) -> Result<()> {
        self.ip.delete_link(netns, name)
    }

    fn link_names(&mut self, netns: Option<&Namespace>) -> Result<Vec<String>> {
        self.ip.link_names(netns)
    }
}
