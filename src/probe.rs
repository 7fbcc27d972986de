//! Per-device port, service and OS probing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;

use crate::config::ScanSettings;
use crate::error::{Error, Result};
use crate::ports;
use crate::types::{PortFinding, ProbeResult};

/// Probes one host. Errors are reported to the orchestrator, which logs them
/// and leaves the device's stored data untouched.
#[async_trait]
pub trait DeviceProber: Send + Sync {
    async fn probe(&self, ip: &str) -> Result<ProbeResult>;
}

/// Asynchronous TCP connect scan with a short passive banner grab.
///
/// Only ports that accept a connection are reported (all as `open`).
/// Service names come from the well-known port table, the version string is
/// the first banner line, and the OS label is guessed from banner keywords.
pub struct ConnectProber {
    ports: Vec<u16>,
    concurrency: usize,
    timeout: Duration,
}

impl ConnectProber {
    pub fn new(settings: &ScanSettings) -> Self {
        Self {
            ports: settings.ports.clone(),
            concurrency: settings.concurrency,
            timeout: settings.connect_timeout,
        }
    }
}

#[async_trait]
impl DeviceProber for ConnectProber {
    async fn probe(&self, ip: &str) -> Result<ProbeResult> {
        let addr: IpAddr = ip.parse().map_err(|e| Error::Probe {
            ip: ip.to_string(),
            message: format!("not an IP address: {e}"),
        })?;

        let sem = Arc::new(Semaphore::new(self.concurrency.clamp(1, 1_000)));
        let mut set = JoinSet::new();
        for &port in &self.ports {
            let permit = sem.clone().acquire_owned().await.map_err(|e| Error::Probe {
                ip: ip.to_string(),
                message: e.to_string(),
            })?;
            let timeout = self.timeout;
            set.spawn(async move {
                let _permit = permit;
                let sock = SocketAddr::new(addr, port);
                match time::timeout(timeout, TcpStream::connect(sock)).await {
                    Ok(Ok(mut stream)) => Some((port, read_banner(&mut stream).await)),
                    _ => None,
                }
            });
        }

        let mut open = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Some(hit)) => open.push(hit),
                Ok(None) => {}
                Err(e) => {
                    return Err(Error::Probe {
                        ip: ip.to_string(),
                        message: format!("probe task failed: {e}"),
                    })
                }
            }
        }
        open.sort_by_key(|(port, _)| *port);

        let os = open.iter().find_map(|(_, banner)| banner.as_deref().and_then(guess_os));
        let findings = open
            .into_iter()
            .map(|(port, banner)| PortFinding {
                service: ports::service_name(port).map(str::to_string),
                version: banner.as_deref().map(first_line).filter(|v| !v.is_empty()),
                ..PortFinding::open_tcp(port)
            })
            .collect();

        tracing::debug!(ip = %ip, os = ?os, "Probe finished");
        Ok(ProbeResult {
            ip: ip.to_string(),
            os,
            ports: findings,
        })
    }
}

/// Try to read up to 256 bytes from the stream with a short timeout and convert to a lossy UTF-8 string.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        _ => None,
    }
}

fn first_line(banner: &str) -> String {
    banner
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .take(120)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Best-effort OS label from a service banner.
pub fn guess_os(banner: &str) -> Option<String> {
    const HINTS: &[(&str, &str)] = &[
        ("ubuntu", "Linux (Ubuntu)"),
        ("debian", "Linux (Debian)"),
        ("raspbian", "Linux (Raspberry Pi OS)"),
        ("fedora", "Linux (Fedora)"),
        ("centos", "Linux (CentOS)"),
        ("openwrt", "Linux (OpenWrt)"),
        ("dropbear", "Linux (embedded)"),
        ("freebsd", "FreeBSD"),
        ("microsoft", "Windows"),
        ("windows", "Windows"),
        ("darwin", "macOS"),
        ("mac os", "macOS"),
    ];
    let lower = banner.to_lowercase();
    HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, label)| label.to_string())
}
