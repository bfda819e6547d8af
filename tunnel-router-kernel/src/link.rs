use std::net::Ipv4Addr;

use crate::command::{IpRoute2, parse_link_index, parse_link_names};
use crate::netns::{Namespace, NetNsRef};
use crate::{Error, Result};

/// Longest interface name the kernel accepts (IFNAMSIZ minus the nul).
pub const MAX_IFNAME_LEN: usize = 15;

/// A GRE point-to-point tunnel to be created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunnel {
    pub name: String,
    pub remote: Ipv4Addr,
    pub local: Option<Ipv4Addr>,
}

/// A tunnel interface the reconciler manages.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    /// Lives inside the backend's namespace rather than the host's.
    pub internal: bool,
}

/// Host-side tunnel name: prefix plus the hex-encoded peer address.
pub fn host_tunnel_name(prefix: &str, peer: Ipv4Addr) -> Result<String> {
    let hex: String = peer.octets().iter().map(|b| format!("{b:02x}")).collect();
    checked_ifname(format!("{prefix}{hex}"))
}

/// Namespace-side tunnel name: prefix plus the service name.
pub fn namespace_tunnel_name(prefix: &str, service: &str) -> Result<String> {
    checked_ifname(format!("{prefix}{service}"))
}

/// Names are never shortened: two peers sharing a truncated name would
/// share one interface.
fn checked_ifname(name: String) -> Result<String> {
    if name.len() > MAX_IFNAME_LEN {
        return Err(Error::InvalidName(name));
    }
    Ok(name)
}

pub trait Links {
    /// Scoped handle on an open namespace; released on drop.
    type Namespace;

    fn open_namespace(&mut self, reference: &NetNsRef) -> Result<Self::Namespace>;
    fn add_tunnel(&mut self, netns: Option<&Self::Namespace>, tunnel: &Tunnel) -> Result<()>;
    /// Assigns `address/32` to the link.
    fn add_address(
        &mut self,
        netns: Option<&Self::Namespace>,
        name: &str,
        address: Ipv4Addr,
    ) -> Result<()>;
    fn set_up(&mut self, netns: Option<&Self::Namespace>, name: &str) -> Result<()>;
    fn link_index(&mut self, netns: Option<&Self::Namespace>, name: &str) -> Result<u32>;
    fn delete_link(&mut self, netns: Option<&Self::Namespace>, name: &str) -> Result<()>;
    fn link_names(&mut self, netns: Option<&Self::Namespace>) -> Result<Vec<String>>;
}

impl Links for IpRoute2 {
    type Namespace = Namespace;

    fn open_namespace(&mut self, reference: &NetNsRef) -> Result<Namespace> {
        Namespace::open(reference)
    }

    fn add_tunnel(&mut self, netns: Option<&Namespace>, tunnel: &Tunnel) -> Result<()> {
        let remote = tunnel.remote.to_string();
        let mut args = vec![
            "link",
            "add",
            tunnel.name.as_str(),
            "type",
            "gre",
            "remote",
            remote.as_str(),
        ];
        let local = tunnel.local.map(|l| l.to_string());
        if let Some(local) = &local {
            args.extend(["local", local.as_str()]);
        }
        self.exec(netns, &args)?;
        Ok(())
    }

    fn add_address(
        &mut self,
        netns: Option<&Namespace>,
        name: &str,
        address: Ipv4Addr,
    ) -> Result<()> {
        let address = format!("{address}/32");
        self.exec(netns, &["addr", "add", &address, "dev", name])?;
        Ok(())
    }

    fn set_up(&mut self, netns: Option<&Namespace>, name: &str) -> Result<()> {
        self.exec(netns, &["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn link_index(&mut self, netns: Option<&Namespace>, name: &str) -> Result<u32> {
        let out = self.exec(netns, &["-o", "link", "show", "dev", name])?;
        parse_link_index(&out)
    }

    fn delete_link(&mut self, netns: Option<&Namespace>, name: &str) -> Result<()> {
        self.exec(netns, &["link", "del", "dev", name])?;
        Ok(())
    }

    fn link_names(&mut self, netns: Option<&Namespace>) -> Result<Vec<String>> {
        let out = self.exec(netns, &["-o", "link", "show"])?;
        Ok(parse_link_names(&out))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_tunnel_name() {
        assert_eq!(
            host_tunnel_name("ts", Ipv4Addr::new(10, 1, 1, 2)).unwrap(),
            "ts0a010102"
        );
        assert_eq!(
            host_tunnel_name("ts", Ipv4Addr::new(192, 168, 255, 1)).unwrap(),
            "tsc0a8ff01"
        );
        assert_eq!(
            host_tunnel_name("tunnel0", Ipv4Addr::new(10, 1, 1, 2)).unwrap(),
            "tunnel00a010102"
        );
    }

    #[test]
    fn test_long_prefix_does_not_share_names() {
        let a = host_tunnel_name("tunnelrt", Ipv4Addr::new(10, 1, 1, 2));
        let b = host_tunnel_name("tunnelrt", Ipv4Addr::new(10, 1, 1, 3));
        assert!(matches!(a, Err(Error::InvalidName(_))));
        assert!(matches!(b, Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_namespace_tunnel_name() {
        assert_eq!(namespace_tunnel_name("ts", "web").unwrap(), "tsweb");
        assert_eq!(
            namespace_tunnel_name("ts", "thirteen-char").unwrap().len(),
            MAX_IFNAME_LEN
        );
        // these would collide on `tsa-very-long-s` if cut short
        assert!(namespace_tunnel_name("ts", "a-very-long-service-one").is_err());
        assert!(namespace_tunnel_name("ts", "a-very-long-service-two").is_err());
    }
}
