use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::netdetect::SubnetTarget;
use crate::ports;

/// Tuning shared by the discovery sweep and the per-device prober.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Subnet used when a run is started without one.
    pub default_subnet: SubnetTarget,
    /// Ports probed on each discovered device.
    pub ports: Vec<u16>,
    /// Max concurrent TCP connect attempts.
    pub concurrency: usize,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// Kernel neighbour table consulted for MAC addresses.
    pub arp_table: PathBuf,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            default_subnet: SubnetTarget::Auto,
            ports: ports::default_ports(),
            concurrency: 256,
            connect_timeout: Duration::from_millis(400),
            arp_table: PathBuf::from("/proc/net/arp"),
        }
    }
}

/// Everything `main` needs to wire up the service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub ui_dir: PathBuf,
    pub data_file: Option<PathBuf>,
    /// Overrides the stored schedule at startup when set.
    pub scan_interval_minutes: Option<u64>,
    pub scan_on_start: bool,
    pub scan: ScanSettings,
}
