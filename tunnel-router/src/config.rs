use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tunnel_router_kernel::MAX_IFNAME_LEN;

use crate::{Error, Result};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

/// How traffic for a tunnel IP is carried to its backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Encapsulation {
    /// Routes push a fixed MPLS label towards the backend.
    Mpls,
    /// A GRE interface per backend.
    Gre,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Prefix of every tunnel interface this agent manages
    #[arg(long, env = "TUNNEL_ROUTER_TUNNEL_PREFIX", default_value = "ts")]
    pub tunnel_prefix: String,

    /// Number of routing tables traffic is spread across
    #[arg(long, env = "TUNNEL_ROUTER_BUCKETS", default_value_t = 2)]
    pub buckets: u32,

    /// Encapsulation towards backends
    #[arg(long, env = "TUNNEL_ROUTER_MODE", value_enum, default_value = "mpls")]
    pub mode: Encapsulation,

    /// Mangle chain holding the bucket marking rule
    #[arg(long, env = "TUNNEL_ROUTER_INGRESS_CHAIN", default_value = "TUNNEL-INGRESS")]
    pub ingress_chain: String,

    /// Mangle chain holding one rule per tunnel IP
    #[arg(long, env = "TUNNEL_ROUTER_FILTER_CHAIN", default_value = "TUNNEL-FILTER")]
    pub filter_chain: String,

    /// Service annotation carrying the tunnel IP
    #[arg(
        long,
        env = "TUNNEL_ROUTER_TUNNEL_ANNOTATION",
        default_value = "cmd.nu/tunnel"
    )]
    pub tunnel_annotation: String,

    /// First mark and routing table number used for buckets
    #[arg(long, env = "TUNNEL_ROUTER_TABLE_OFFSET", default_value_t = 1)]
    pub table_offset: u32,

    /// Label pushed on routes in mpls mode
    #[arg(long, env = "TUNNEL_ROUTER_MPLS_LABEL", default_value_t = 100)]
    pub mpls_label: u32,

    /// Seconds to idle between reconciliation cycles
    #[arg(long, env = "TUNNEL_ROUTER_POLL_INTERVAL", default_value_t = 1)]
    pub poll_interval: u64,

    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Address of this node, the far end of namespace-side tunnels
    #[arg(long, env = "NODE_IP")]
    pub node_ip: Option<Ipv4Addr>,

    /// Directory holding pinned pod network namespaces
    #[arg(long, env = "TUNNEL_ROUTER_NETNS_DIR", default_value = "/var/run/netns")]
    pub netns_dir: PathBuf,

    /// Metrics listener for agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

impl AgentArgs {
    pub fn validate(&self) -> Result<()> {
        if self.buckets == 0 {
            return Err(Error::InvalidConfig("buckets must be at least 1".into()));
        }
        if self.table_offset.checked_add(self.buckets).is_none() {
            return Err(Error::InvalidConfig(format!(
                "table offset {} overflows with {} buckets",
                self.table_offset, self.buckets
            )));
        }
        if self.mode == Encapsulation::Gre && self.node_ip.is_none() {
            return Err(Error::InvalidConfig("gre mode requires --node-ip".into()));
        }
        if self.tunnel_prefix.is_empty() {
            return Err(Error::InvalidConfig("tunnel prefix must not be empty".into()));
        }
        // host tunnels append eight hex digits of the peer address
        if self.tunnel_prefix.len() > MAX_IFNAME_LEN - 8 {
            return Err(Error::InvalidConfig(format!(
                "tunnel prefix `{}` is longer than {} bytes",
                self.tunnel_prefix,
                MAX_IFNAME_LEN - 8
            )));
        }
        Ok(())
    }

    /// Longest service name that still yields a namespace tunnel name, in
    /// the modes that create one.
    pub fn service_name_limit(&self) -> Option<usize> {
        match self.mode {
            Encapsulation::Mpls => None,
            Encapsulation::Gre => Some(MAX_IFNAME_LEN.saturating_sub(self.tunnel_prefix.len())),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn routing(&self) -> RoutingConfig {
        RoutingConfig {
            mode: self.mode,
            buckets: self.buckets,
            table_offset: self.table_offset,
            tunnel_prefix: self.tunnel_prefix.clone(),
            mpls_label: self.mpls_label,
            node_ip: self.node_ip,
            ingress_chain: self.ingress_chain.clone(),
            filter_chain: self.filter_chain.clone(),
        }
    }
}

/// The part of the configuration the change operations read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
    pub mode: Encapsulation,
    pub buckets: u32,
    pub table_offset: u32,
    pub tunnel_prefix: String,
    pub mpls_label: u32,
    pub node_ip: Option<Ipv4Addr>,
    pub ingress_chain: String,
    pub filter_chain: String,
}

impl RoutingConfig {
    /// Routing table (and mark) numbers, one per bucket.
    pub fn tables(&self) -> impl Iterator<Item = u32> + use<> {
        let offset = self.table_offset;
        (0..self.buckets).map(move |i| offset + i)
    }
}
