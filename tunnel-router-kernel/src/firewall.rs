use std::fmt;

use tracing::debug;

use crate::{Error, Result};

const MANGLE: &str = "mangle";

/// A rule in the `mangle` table, identified by chain and rule spec.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub chain: String,
    pub spec: String,
}

impl FirewallRule {
    pub fn new(chain: impl Into<String>, spec: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            spec: spec.into(),
        }
    }

    /// Rule jumping to `target`.
    pub fn jump(chain: impl Into<String>, target: &str) -> Self {
        Self::new(chain, format!("-j {target}"))
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-A {} {}", self.chain, self.spec)
    }
}

pub trait Firewall {
    /// Creates the chain, or flushes it when it already exists.
    fn ensure_chain(&mut self, chain: &str) -> Result<()>;
    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool>;
    /// Inserts the rule at the head of its chain.
    fn insert_rule(&mut self, rule: &FirewallRule) -> Result<()>;
    fn delete_rule(&mut self, rule: &FirewallRule) -> Result<()>;
}

/// iptables-backed firewall operating on the `mangle` table.
pub struct IptablesFirewall {
    ipt: iptables::IPTables,
}

impl IptablesFirewall {
    pub fn try_new() -> Result<Self> {
        let ipt = iptables::new(false).map_err(|e| Error::Iptables(e.to_string()))?;
        Ok(Self { ipt })
    }
}

impl Firewall for IptablesFirewall {
    fn ensure_chain(&mut self, chain: &str) -> Result<()> {
        let exists = self
            .ipt
            .chain_exists(MANGLE, chain)
            .map_err(|e| Error::Iptables(e.to_string()))?;
        if exists {
            debug!(chain, "flushing existing chain");
            self.ipt
                .flush_chain(MANGLE, chain)
                .map_err(|e| Error::Iptables(e.to_string()))
        } else {
            debug!(chain, "creating chain");
            self.ipt
                .new_chain(MANGLE, chain)
                .map_err(|e| Error::Iptables(e.to_string()))
        }
    }

    fn rule_exists(&self, rule: &FirewallRule) -> Result<bool> {
        self.ipt
            .exists(MANGLE, &rule.chain, &rule.spec)
            .map_err(|e| Error::Iptables(e.to_string()))
    }

    fn insert_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        if self.rule_exists(rule)? {
            return Err(Error::AlreadyExists(rule.to_string()));
        }
        self.ipt
            .insert(MANGLE, &rule.chain, &rule.spec, 1)
            .map_err(|e| Error::Iptables(e.to_string()))
    }

    fn delete_rule(&mut self, rule: &FirewallRule) -> Result<()> {
        if !self.rule_exists(rule)? {
            return Err(Error::NotFound(rule.to_string()));
        }
        self.ipt
            .delete(MANGLE, &rule.chain, &rule.spec)
            .map_err(|e| Error::Iptables(e.to_string()))
    }
}
