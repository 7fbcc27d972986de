use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};

use crate::error::{Error, Result};

/// Largest network the sweep will expand (a /16).
pub const MAX_SWEEP_HOSTS: usize = 65_534;

/// What the discovery phase should sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetTarget {
    /// Detect the local /24 at scan time.
    Auto,
    Cidr(Ipv4Net),
}

impl SubnetTarget {
    /// Resolve an optional user-supplied subnet; blank means `Auto`.
    pub fn from_optional(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(SubnetTarget::Auto),
            Some(s) => s.parse(),
        }
    }

    /// Concrete network to sweep, detecting the local one for `Auto`.
    pub fn resolve(&self) -> Ipv4Net {
        match self {
            SubnetTarget::Cidr(net) => *net,
            SubnetTarget::Auto => detect_local_cidrs()
                .ok()
                .and_then(|nets| nets.into_iter().next())
                .unwrap_or_else(fallback_subnet),
        }
    }
}

impl FromStr for SubnetTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(SubnetTarget::Auto);
        }
        let net = if s.contains('/') {
            match s.parse::<IpNet>() {
                Ok(IpNet::V4(n)) => n.trunc(),
                Ok(IpNet::V6(_)) => {
                    return Err(Error::Validation(format!("IPv6 subnets are not scanned: {s}")))
                }
                Err(e) => return Err(Error::Validation(format!("invalid CIDR {s}: {e}"))),
            }
        } else {
            let ip = s
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::Validation(format!("invalid IPv4 address {s}: {e}")))?;
            Ipv4Net::new(ip, 32).map_err(|e| Error::Validation(e.to_string()))?
        };
        if net.prefix_len() < 16 {
            return Err(Error::Validation(format!(
                "subnet {net} is too large to sweep (minimum prefix is /16)"
            )));
        }
        Ok(SubnetTarget::Cidr(net))
    }
}

impl fmt::Display for SubnetTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetTarget::Auto => f.write_str("auto"),
            SubnetTarget::Cidr(net) => write!(f, "{net}"),
        }
    }
}

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Link-local (169.254/16) interfaces are skipped.
pub fn detect_local_cidrs() -> Result<Vec<Ipv4Net>> {
    let mut set = BTreeSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() || ip.is_link_local() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(ip));
        }
    }
    Ok(set.into_iter().collect())
}

/// Expand a network into host addresses, excluding network and broadcast
/// addresses for anything larger than a /31.
pub fn expand_hosts(net: Ipv4Net) -> Vec<IpAddr> {
    match net.prefix_len() {
        32 => vec![IpAddr::V4(net.addr())],
        31 => vec![
            IpAddr::V4(net.network()),
            IpAddr::V4(net.broadcast()),
        ],
        _ => {
            let start = u32::from(net.network());
            let end = u32::from(net.broadcast());
            (start + 1..end)
                .take(MAX_SWEEP_HOSTS)
                .map(|n| IpAddr::V4(Ipv4Addr::from(n)))
                .collect()
        }
    }
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

fn fallback_subnet() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 24).expect("/24 is always valid")
}

/// Sort key that orders dotted IPv4 strings numerically; anything else sorts last.
pub fn ip_sort_key(ip: &str) -> (u8, u32, String) {
    match ip.parse::<Ipv4Addr>() {
        Ok(v4) => (0, u32::from(v4), String::new()),
        Err(_) => (1, 0, ip.to_string()),
    }
}
