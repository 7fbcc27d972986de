use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_inventory_rs::config::{ScanSettings, ServiceConfig};
use lan_inventory_rs::discover::SweepDiscoverer;
use lan_inventory_rs::netdetect::{self, SubnetTarget};
use lan_inventory_rs::orchestrator::Orchestrator;
use lan_inventory_rs::ports;
use lan_inventory_rs::probe::ConnectProber;
use lan_inventory_rs::progress::ProgressChannel;
use lan_inventory_rs::scheduler::Scheduler;
use lan_inventory_rs::server::{self, AppState};
use lan_inventory_rs::store::{SqliteStore, Store};
use lan_inventory_rs::types::ScheduleConfig;
use lan_inventory_rs::vendor::OuiVendorResolver;

/// lan-inventory-rs: keeps an inventory of the devices on your home network.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-inventory-rs",
    version,
    about = "Discovers LAN devices, enriches them with vendor/port/OS data and serves the inventory with live scan progress.",
    long_about = None
)]
struct Cli {
    /// Address for the HTTP API, WebSocket and UI.
    #[arg(long, env = "LAN_INVENTORY_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Default subnet to scan (CIDR or single IPv4). If omitted, auto-detect local /24.
    #[arg(long, env = "LAN_INVENTORY_SUBNET")]
    subnet: Option<String>,

    /// Ports probed per device: inline list (`22,80,8000-8010`) or a ports file.
    #[arg(long, env = "LAN_INVENTORY_PORTS")]
    ports: Option<String>,

    /// Max concurrent TCP connect attempts.
    #[arg(long, default_value_t = 256)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 400)]
    timeout_ms: u64,

    /// SQLite database the inventory is kept in. Memory only when omitted.
    #[arg(long, env = "LAN_INVENTORY_DATA")]
    data: Option<PathBuf>,

    /// Directory with the built web UI.
    #[arg(long = "ui-dir", default_value = "ui")]
    ui_dir: PathBuf,

    /// Enable the auto-scan schedule with this interval, overriding the stored one.
    #[arg(long = "scan-interval-minutes")]
    scan_interval_minutes: Option<u64>,

    /// Kick off one scan as soon as the server is up.
    #[arg(long = "scan-on-start", default_value_t = false)]
    scan_on_start: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServiceConfig> {
        let default_subnet = SubnetTarget::from_optional(self.subnet.as_deref())
            .context("invalid --subnet")?;
        let ports = ports::load_port_option(self.ports.as_deref()).context("invalid --ports")?;
        Ok(ServiceConfig {
            bind: self.bind,
            ui_dir: self.ui_dir,
            data_file: self.data,
            scan_interval_minutes: self.scan_interval_minutes,
            scan_on_start: self.scan_on_start,
            scan: ScanSettings {
                default_subnet,
                ports,
                concurrency: self.concurrency,
                connect_timeout: Duration::from_millis(self.timeout_ms),
                ..ScanSettings::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lan_inventory_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    tracing::info!(
        bind = %config.bind,
        subnet = %config.scan.default_subnet,
        ports = config.scan.ports.len(),
        concurrency = config.scan.concurrency,
        timeout_ms = config.scan.connect_timeout.as_millis() as u64,
        data = ?config.data_file,
        "Starting lan-inventory-rs v{}",
        env!("CARGO_PKG_VERSION")
    );
    if config.scan.default_subnet == SubnetTarget::Auto {
        match netdetect::detect_local_cidrs() {
            Ok(cidrs) => tracing::info!(detected = ?cidrs, "Local IPv4 networks"),
            Err(e) => tracing::warn!(error = %e, "Failed to detect local networks"),
        }
    }

    let store: Arc<dyn Store> = match &config.data_file {
        Some(path) => Arc::new(SqliteStore::open(path).context("failed to open inventory database")?),
        None => Arc::new(SqliteStore::open_in_memory().context("failed to create in-memory database")?),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::new(SweepDiscoverer::new(&config.scan)),
        Arc::new(ConnectProber::new(&config.scan)),
        Arc::new(OuiVendorResolver::new()),
        Arc::new(ProgressChannel::new()),
        config.scan.default_subnet.clone(),
    ));

    let scheduler = Arc::new(Scheduler::start(orchestrator.clone(), store.clone()).await?);
    if let Some(minutes) = config.scan_interval_minutes {
        scheduler
            .configure(ScheduleConfig {
                enabled: true,
                interval_minutes: minutes,
            })
            .await?;
    }

    if config.scan_on_start {
        orchestrator.request_run();
    }

    let state = AppState {
        orchestrator,
        store,
        scheduler,
    };
    server::serve(config.bind, server::app(state, &config.ui_dir)).await
}
