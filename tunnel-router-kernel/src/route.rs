use std::fmt;
use std::net::Ipv4Addr;

use crate::command::IpRoute2;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NextHop {
    /// Out through a point-to-point tunnel interface.
    Device(String),
    /// Via a gateway, pushing a fixed MPLS label.
    Mpls { gateway: Ipv4Addr, label: u32 },
}

/// A host route to `destination/32` in one routing table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub table: u32,
    pub next_hop: NextHop,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.next_hop {
            NextHop::Device(dev) => {
                write!(f, "{}/32 dev {} table {}", self.destination, dev, self.table)
            }
            NextHop::Mpls { gateway, label } => write!(
                f,
                "{}/32 encap mpls {} via {} table {}",
                self.destination, label, gateway, self.table
            ),
        }
    }
}

/// Selects `table` for packets carrying `mark`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PolicyRule {
    pub mark: u32,
    pub table: u32,
}

pub trait Routing {
    fn add_route(&mut self, route: &Route) -> Result<()>;
    fn delete_route(&mut self, destination: Ipv4Addr, table: u32) -> Result<()>;
    fn flush_table(&mut self, table: u32) -> Result<()>;
    fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<()>;
}

impl Routing for IpRoute2 {
    fn add_route(&mut self, route: &Route) -> Result<()> {
        let destination = format!("{}/32", route.destination);
        let table = route.table.to_string();
        match &route.next_hop {
            NextHop::Device(dev) => {
                self.exec(
                    None,
                    &["route", "add", &destination, "dev", dev, "table", &table],
                )?;
            }
            NextHop::Mpls { gateway, label } => {
                let label = label.to_string();
                let gateway = gateway.to_string();
                self.exec(
                    None,
                    &[
                        "route",
                        "add",
                        &destination,
                        "encap",
                        "mpls",
                        &label,
                        "via",
                        &gateway,
                        "table",
                        &table,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn delete_route(&mut self, destination: Ipv4Addr, table: u32) -> Result<()> {
        let destination = format!("{destination}/32");
        let table = table.to_string();
        self.exec(None, &["route", "del", &destination, "table", &table])?;
        Ok(())
    }

    fn flush_table(&mut self, table: u32) -> Result<()> {
        let table = table.to_string();
        match self.exec(None, &["route", "flush", "table", &table]) {
            // flushing an empty table is reported as a missing table
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn add_policy_rule(&mut self, rule: PolicyRule) -> Result<()> {
        // `ip rule add` happily installs duplicates, so look first
        let listing = self.exec(None, &["rule", "show"])?;
        if has_policy_rule(&listing, rule) {
            return Err(Error::AlreadyExists(format!(
                "rule fwmark {} table {}",
                rule.mark, rule.table
            )));
        }
        let mark = rule.mark.to_string();
        let table = rule.table.to_string();
        self.exec(None, &["rule", "add", "fwmark", &mark, "table", &table])?;
        Ok(())
    }
}

/// Looks for `fwmark <mark> lookup <table>` in `ip rule show` output.
fn has_policy_rule(listing: &str, rule: PolicyRule) -> bool {
    listing.lines().any(|line| {
        let words: Vec<&str> = line.split_whitespace().collect();
        let mark = words
            .windows(2)
            .find(|w| w[0] == "fwmark")
            .and_then(|w| parse_mark(w[1]));
        let table = words
            .windows(2)
            .find(|w| w[0] == "lookup")
            .and_then(|w| w[1].parse::<u32>().ok());
        mark == Some(rule.mark) && table == Some(rule.table)
    })
}

fn parse_mark(s: &str) -> Option<u32> {
    let s = s.split('/').next()?;
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_has_policy_rule() {
        let listing = "0:\tfrom all lookup local\n\
                       32764:\tfrom all fwmark 0x2 lookup 2\n\
                       32765:\tfrom all fwmark 0x1 lookup 1\n\
                       32766:\tfrom all lookup main\n";
        assert!(has_policy_rule(listing, PolicyRule { mark: 1, table: 1 }));
        assert!(has_policy_rule(listing, PolicyRule { mark: 2, table: 2 }));
        assert!(!has_policy_rule(listing, PolicyRule { mark: 3, table: 3 }));
        assert!(!has_policy_rule(listing, PolicyRule { mark: 1, table: 2 }));
    }

    #[test]
    fn test_route_display() {
        let route = Route {
            destination: Ipv4Addr::new(10, 0, 0, 5),
            table: 2,
            next_hop: NextHop::Mpls {
                gateway: Ipv4Addr::new(10, 1, 1, 1),
                label: 100,
            },
        };
        assert_eq!(
            route.to_string(),
            "10.0.0.5/32 encap mpls 100 via 10.1.1.1 table 2"
        );
    }
}
