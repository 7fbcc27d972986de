#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lan_inventory_rs::discover::{DiscoveryProgress, HostDiscoverer};
use lan_inventory_rs::netdetect::SubnetTarget;
use lan_inventory_rs::orchestrator::Orchestrator;
use lan_inventory_rs::probe::DeviceProber;
use lan_inventory_rs::progress::ProgressChannel;
use lan_inventory_rs::store::{SqliteStore, Store};
use lan_inventory_rs::types::{
    Category, Device, DevicePatch, DeviceSighting, Host, PortFinding, PresenceRecord,
    ProbeResult, RunStatus, ScanRun, ScheduleConfig,
};
use lan_inventory_rs::vendor::VendorLookup;
use lan_inventory_rs::{Error, Result};
use time::OffsetDateTime;
use tokio::sync::Semaphore;

/// Returns a fixed host list, optionally waiting on a gate first.
pub struct FakeDiscoverer {
    pub hosts: Vec<Host>,
    pub fail: Option<String>,
    pub gate: Option<Arc<Semaphore>>,
    pub calls: AtomicUsize,
}

impl FakeDiscoverer {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            fail: None,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Blocks in `discover` until a permit is added to the returned semaphore.
    pub fn gated(hosts: Vec<Host>) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                gate: Some(gate.clone()),
                ..Self::new(hosts)
            },
            gate,
        )
    }
}

#[async_trait]
impl HostDiscoverer for FakeDiscoverer {
    async fn discover(
        &self,
        _target: &SubnetTarget,
        progress: &dyn DiscoveryProgress,
    ) -> Result<Vec<Host>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|e| Error::Internal(e.to_string()))?;
            permit.forget();
        }
        if let Some(message) = &self.fail {
            return Err(Error::Discovery(message.clone()));
        }
        for (i, host) in self.hosts.iter().enumerate() {
            progress.host_found(i + 1, self.hosts.len(), host);
        }
        Ok(self.hosts.clone())
    }
}

/// Canned probe answers per address; unknown addresses get an empty result.
#[derive(Default)]
pub struct FakeProber {
    answers: Mutex<HashMap<String, std::result::Result<ProbeResult, String>>>,
    pub probed: Mutex<Vec<String>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(self, ip: &str, os: Option<&str>, ports: &[u16]) -> Self {
        let result = ProbeResult {
            ip: ip.to_string(),
            os: os.map(str::to_string),
            ports: ports.iter().map(|p| PortFinding::open_tcp(*p)).collect(),
        };
        self.answers.lock().unwrap().insert(ip.to_string(), Ok(result));
        self
    }

    pub fn findings(self, ip: &str, ports: Vec<PortFinding>) -> Self {
        let result = ProbeResult { ip: ip.to_string(), os: None, ports };
        self.answers.lock().unwrap().insert(ip.to_string(), Ok(result));
        self
    }

    pub fn fail(self, ip: &str, message: &str) -> Self {
        self.answers
            .lock()
            .unwrap()
            .insert(ip.to_string(), Err(message.to_string()));
        self
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceProber for FakeProber {
    async fn probe(&self, ip: &str) -> Result<ProbeResult> {
        self.probed.lock().unwrap().push(ip.to_string());
        let answer = self.answers.lock().unwrap().get(ip).cloned();
        match answer {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(Error::Probe {
                ip: ip.to_string(),
                message,
            }),
            None => Ok(ProbeResult::empty(ip)),
        }
    }
}

/// MAC → vendor table.
#[derive(Default)]
pub struct StaticVendors(pub HashMap<String, String>);

impl StaticVendors {
    pub fn with(mut self, mac: &str, vendor: &str) -> Self {
        self.0.insert(mac.to_string(), vendor.to_string());
        self
    }
}

#[async_trait]
impl VendorLookup for StaticVendors {
    async fn resolve(&self, mac: Option<&str>) -> Option<String> {
        self.0.get(mac?).cloned()
    }
}

/// In-memory SQLite store whose `replace_ports` can be made to fail.
pub struct FlakyStore {
    pub inner: SqliteStore,
    pub fail_replace_ports: bool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.inner.list_devices().await
    }
    async fn get_device(&self, id: u64) -> Result<Option<Device>> {
        self.inner.get_device(id).await
    }
    async fn find_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        self.inner.find_device_by_ip(ip).await
    }
    async fn upsert_sighting(&self, sighting: DeviceSighting) -> Result<Device> {
        self.inner.upsert_sighting(sighting).await
    }
    async fn mark_all_offline(&self) -> Result<usize> {
        self.inner.mark_all_offline().await
    }
    async fn replace_ports(
        &self,
        device_id: u64,
        findings: &[PortFinding],
        seen_at: OffsetDateTime,
    ) -> Result<()> {
        if self.fail_replace_ports {
            return Err(Error::Store("disk full".into()));
        }
        self.inner.replace_ports(device_id, findings, seen_at).await
    }
    async fn update_probe_fields(&self, device_id: u64, os: Option<String>, icon_type: Category) -> Result<()> {
        self.inner.update_probe_fields(device_id, os, icon_type).await
    }
    async fn patch_device(&self, id: u64, patch: DevicePatch) -> Result<Device> {
        self.inner.patch_device(id, patch).await
    }
    async fn create_run(&self, started_at: OffsetDateTime) -> Result<ScanRun> {
        self.inner.create_run(started_at).await
    }
    async fn finish_run(
        &self,
        id: u64,
        status: RunStatus,
        devices_found: u64,
        error_msg: Option<String>,
        finished_at: OffsetDateTime,
    ) -> Result<ScanRun> {
        self.inner
            .finish_run(id, status, devices_found, error_msg, finished_at)
            .await
    }
    async fn list_runs(&self, limit: usize) -> Result<Vec<ScanRun>> {
        self.inner.list_runs(limit).await
    }
    async fn record_presence(&self, scan_id: u64, scanned_at: OffsetDateTime) -> Result<usize> {
        self.inner.record_presence(scan_id, scanned_at).await
    }
    async fn presence_for_run(&self, scan_id: u64) -> Result<Vec<PresenceRecord>> {
        self.inner.presence_for_run(scan_id).await
    }
    async fn device_history(&self, device_id: u64, limit: usize) -> Result<Vec<PresenceRecord>> {
        self.inner.device_history(device_id, limit).await
    }
    async fn count_online(&self) -> Result<u64> {
        self.inner.count_online().await
    }
    async fn schedule(&self) -> Result<ScheduleConfig> {
        self.inner.schedule().await
    }
    async fn set_schedule(&self, config: ScheduleConfig) -> Result<ScheduleConfig> {
        self.inner.set_schedule(config).await
    }
}

pub fn memory_store() -> SqliteStore {
    SqliteStore::open_in_memory().unwrap()
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    pub discoverer: Arc<FakeDiscoverer>,
    pub prober: Arc<FakeProber>,
    pub progress: Arc<ProgressChannel>,
}

pub fn harness(discoverer: FakeDiscoverer, prober: FakeProber, vendors: StaticVendors) -> Harness {
    harness_with_store(Arc::new(memory_store()), discoverer, prober, vendors)
}

pub fn harness_with_store(
    store: Arc<dyn Store>,
    discoverer: FakeDiscoverer,
    prober: FakeProber,
    vendors: StaticVendors,
) -> Harness {
    let discoverer = Arc::new(discoverer);
    let prober = Arc::new(prober);
    let progress = Arc::new(ProgressChannel::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        discoverer.clone(),
        prober.clone(),
        Arc::new(vendors),
        progress.clone(),
        SubnetTarget::Auto,
    ));
    Harness {
        orchestrator,
        store,
        discoverer,
        prober,
        progress,
    }
}

/// Seed a device the way an earlier run would have left it.
pub async fn seed_device(store: &dyn Store, ip: &str, hostname: Option<&str>, ports: &[u16]) -> Device {
    let device = store
        .upsert_sighting(DeviceSighting {
            ip: ip.to_string(),
            mac: None,
            hostname: hostname.map(str::to_string),
            vendor: None,
            seen_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
    let findings: Vec<PortFinding> = ports.iter().map(|p| PortFinding::open_tcp(*p)).collect();
    store
        .replace_ports(device.id, &findings, OffsetDateTime::now_utc())
        .await
        .unwrap();
    store.get_device(device.id).await.unwrap().unwrap()
}

pub fn port_numbers(device: &Device) -> Vec<u16> {
    let mut ports: Vec<u16> = device.ports.iter().map(|p| p.port).collect();
    ports.sort();
    ports
}
