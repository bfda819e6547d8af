//! Capability handles over the host's firewall, routing tables and links.
//!
//! The reconciler only ever talks to the kernel through the [`Firewall`],
//! [`Routing`] and [`Links`] traits. [`Host`] bundles the production
//! implementations: iptables for the `mangle` chains, iproute2 for routes,
//! policy rules and GRE links, and netns-rs for namespace handles.

pub mod command;
pub mod firewall;
pub mod host;
pub mod link;
pub mod netns;
pub mod route;

pub use command::IpRoute2;
pub use firewall::{Firewall, FirewallRule, IptablesFirewall};
pub use host::Host;
pub use link::{
    Interface, Links, MAX_IFNAME_LEN, Tunnel, host_tunnel_name, namespace_tunnel_name,
};
pub use netns::{Namespace, NetNsRef};
pub use route::{NextHop, PolicyRule, Route, Routing};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("iptables error: {0}")]
    Iptables(String),

    #[error("network namespace error: {0}")]
    NetNs(#[from] netns_rs::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse {0}")]
    Parse(String),

    #[error("interface name `{0}` is longer than the kernel allows")]
    InvalidName(String),

    #[error("namespace thread panicked")]
    Thread,
}

impl Error {
    /// True when a create hit something that is already present.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// True when the target of a delete or lookup is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::AlreadyExists(_) => "already_exists",
            Error::NotFound(_) => "not_found",
            Error::Command { .. } => "command",
            Error::Iptables(_) => "iptables",
            Error::NetNs(_) => "netns",
            Error::Io(_) => "io",
            Error::Parse(_) => "parse",
            Error::InvalidName(_) => "invalid_name",
            Error::Thread => "thread",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Swallows an "already exists" error from a create.
pub fn tolerate_exists(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Swallows a "not found" error from a delete.
pub fn tolerate_missing(res: Result<()>) -> Result<()> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
