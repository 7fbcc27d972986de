//! Host discovery: which addresses on a subnet are currently reachable.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::Resolver;
use ipnet::Ipv4Net;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;

use crate::config::ScanSettings;
use crate::error::{Error, Result};
use crate::netdetect::{self, SubnetTarget};
use crate::ports;
use crate::types::Host;
use crate::vendor::normalize_mac;

/// Told about each host as discovery settles it, with its 1-based position
/// and the number of hosts found.
pub trait DiscoveryProgress: Send + Sync {
    fn host_found(&self, current: usize, total: usize, host: &Host);
}

impl<F> DiscoveryProgress for F
where
    F: Fn(usize, usize, &Host) + Send + Sync,
{
    fn host_found(&self, current: usize, total: usize, host: &Host) {
        self(current, total, host)
    }
}

/// Enumerates live hosts. Zero hosts is a valid, non-error answer.
#[async_trait]
pub trait HostDiscoverer: Send + Sync {
    /// Hosts are reported to `progress` in the order they are returned.
    async fn discover(
        &self,
        target: &SubnetTarget,
        progress: &dyn DiscoveryProgress,
    ) -> Result<Vec<Host>>;
}

/// TCP-connect liveness sweep, enriched from the kernel ARP table and
/// reverse DNS.
///
/// A host is up when any liveness port accepts or actively refuses the
/// connection, or when the neighbour table holds a resolved entry for it
/// after the sweep. Results come back in numeric address order.
pub struct SweepDiscoverer {
    liveness_ports: Vec<u16>,
    concurrency: usize,
    timeout: Duration,
    arp_table: PathBuf,
}

impl SweepDiscoverer {
    pub fn new(settings: &ScanSettings) -> Self {
        Self {
            liveness_ports: ports::liveness_ports(),
            concurrency: settings.concurrency,
            timeout: settings.connect_timeout,
            arp_table: settings.arp_table.clone(),
        }
    }

    async fn sweep(&self, net: Ipv4Net) -> Vec<Ipv4Addr> {
        let sem = Arc::new(Semaphore::new(self.concurrency.clamp(1, 5_000)));
        let mut set = JoinSet::new();

        for ip in netdetect::expand_hosts(net) {
            let IpAddr::V4(v4) = ip else { continue };
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let ports = self.liveness_ports.clone();
            let timeout = self.timeout;
            set.spawn(async move {
                let _permit = permit;
                for port in ports {
                    if answers(SocketAddr::new(ip, port), timeout).await {
                        return Some(v4);
                    }
                }
                None
            });
        }

        let mut up = Vec::new();
        while let Some(res) = set.join_next().await {
            if let Ok(Some(ip)) = res {
                up.push(ip);
            }
        }
        up
    }

    async fn neighbours(&self) -> HashMap<Ipv4Addr, String> {
        let path = self.arp_table.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(path)).await;
        match content {
            Ok(Ok(text)) => parse_arp_table(&text),
            Ok(Err(e)) => {
                tracing::debug!(path = %self.arp_table.display(), error = %e, "ARP table unavailable");
                HashMap::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "ARP table reader panicked");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl HostDiscoverer for SweepDiscoverer {
    async fn discover(
        &self,
        target: &SubnetTarget,
        progress: &dyn DiscoveryProgress,
    ) -> Result<Vec<Host>> {
        let net = target.resolve();
        if netdetect::expand_hosts(net).is_empty() {
            return Err(Error::Discovery(format!("{net} has no host addresses")));
        }
        tracing::info!(subnet = %net, ports = ?self.liveness_ports, "Sweeping subnet");

        let mut alive = self.sweep(net).await;
        let neighbours = self.neighbours().await;
        for ip in neighbours.keys() {
            if net.contains(ip) && !alive.contains(ip) {
                alive.push(*ip);
            }
        }
        alive.sort();

        let resolver = match Resolver::builder_tokio() {
            Ok(builder) => Some(builder.build()),
            Err(e) => {
                tracing::warn!(error = %e, "DNS resolver unavailable, hostnames skipped");
                None
            }
        };

        let total = alive.len();
        let mut hosts = Vec::with_capacity(total);
        for (i, ip) in alive.into_iter().enumerate() {
            let mut host = Host::new(ip.to_string());
            host.mac = neighbours.get(&ip).cloned();
            if let Some(resolver) = &resolver {
                host.hostname = reverse_name(resolver, IpAddr::V4(ip), self.timeout).await;
            }
            progress.host_found(i + 1, total, &host);
            hosts.push(host);
        }

        tracing::info!(subnet = %net, hosts = hosts.len(), "Sweep finished");
        Ok(hosts)
    }
}

/// Connected, or actively refused: either way something is there.
async fn answers(addr: SocketAddr, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
        Err(_) => false,
    }
}

async fn reverse_name(
    resolver: &hickory_resolver::TokioResolver,
    ip: IpAddr,
    timeout: Duration,
) -> Option<String> {
    let lookup = time::timeout(timeout * 4, resolver.reverse_lookup(ip)).await.ok()?.ok()?;
    lookup
        .iter()
        .map(|name| name.to_string().trim_end_matches('.').to_string())
        .find(|name| !name.is_empty())
}

/// Parse `/proc/net/arp` into resolved IPv4 → MAC entries.
///
/// Incomplete entries (flags `0x0` or an all-zero address) are skipped.
pub fn parse_arp_table(text: &str) -> HashMap<Ipv4Addr, String> {
    let mut out = HashMap::new();
    for line in text.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let [ip, _hw_type, flags, mac, ..] = cols.as_slice() else {
            continue;
        };
        if *flags == "0x0" {
            continue;
        }
        let (Ok(ip), Some(mac)) = (ip.parse::<Ipv4Addr>(), normalize_mac(mac)) else {
            continue;
        };
        if mac == "00:00:00:00:00:00" {
            continue;
        }
        out.insert(ip, mac);
    }
    out
}
