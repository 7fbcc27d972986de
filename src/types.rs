use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One reachable host returned by discovery. Never persisted directly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
}

impl Host {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: None,
            hostname: None,
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    #[default]
    Open,
    Closed,
    Filtered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
        }
    }
}

impl FromStr for PortState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            other => Err(format!("unknown port state: {other}")),
        }
    }
}

/// One port observation from a probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortFinding {
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub state: PortState,
}

impl PortFinding {
    /// An open TCP finding with no service details.
    pub fn open_tcp(port: u16) -> Self {
        Self {
            port,
            protocol: "tcp".into(),
            service: None,
            version: None,
            state: PortState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

/// Result of probing a single host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ProbeResult {
    pub ip: String,
    pub os: Option<String>,
    pub ports: Vec<PortFinding>,
}

impl ProbeResult {
    pub fn empty(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            os: None,
            ports: Vec::new(),
        }
    }
}

/// Coarse device category shown as an icon in the UI.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Router,
    Phone,
    Laptop,
    Tv,
    Printer,
    Server,
    #[default]
    Device,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Router,
        Category::Phone,
        Category::Laptop,
        Category::Tv,
        Category::Printer,
        Category::Server,
        Category::Device,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Router => "router",
            Category::Phone => "phone",
            Category::Laptop => "laptop",
            Category::Tv => "tv",
            Category::Printer => "printer",
            Category::Server => "server",
            Category::Device => "device",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown icon type: {s}"))
    }
}

/// Stored open port of a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub id: u64,
    pub device_id: u64,
    pub port: u16,
    pub protocol: String,
    pub service: Option<String>,
    pub version: Option<String>,
    pub state: PortState,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Persistent inventory record, unique by `ip`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: u64,
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os: Option<String>,
    pub nickname: Option<String>,
    pub icon_type: Category,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub is_online: bool,
    #[serde(default)]
    pub ports: Vec<Port>,
}

/// Fields written by the vendor phase for one discovered host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSighting {
    pub ip: String,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub seen_at: OffsetDateTime,
}

/// User-editable fields; `None` leaves the stored value untouched.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePatch {
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub icon_type: Option<Category>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Done,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "error" => Ok(RunStatus::Error),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Bookkeeping row for one orchestration invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRun {
    pub id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub devices_found: u64,
    pub status: RunStatus,
    pub error_msg: Option<String>,
}

/// Per-run, per-device online flag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub id: u64,
    pub device_id: u64,
    pub scan_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub scanned_at: OffsetDateTime,
    pub is_online: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
    Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    Discover,
    Vendor,
    Portscan,
    Done,
}

/// Flat snapshot of pipeline progress, as served by `/api/scan/status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanState {
    pub status: ScanStatus,
    pub phase: Option<ScanPhase>,
    pub current: u64,
    pub total: u64,
    pub device: Option<String>,
    pub scan_id: Option<u64>,
    pub error: Option<String>,
}

/// What the push channel carries: the state plus an optional human message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    #[serde(flatten)]
    pub state: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(state: ScanState) -> Self {
        Self { state, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Auto-scan timer settings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
        }
    }
}

/// Treats `Some("")`/whitespace as absent.
pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
