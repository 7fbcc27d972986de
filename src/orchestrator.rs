//! The scan pipeline: discover → resolve vendors → probe ports.
//!
//! One [`Orchestrator`] lives for the whole process. It owns the single
//! [`ScanState`] snapshot, publishes a [`ProgressEvent`] after every change,
//! and reconciles each run's findings into the [`Store`].
//!
//! At most one run is active. The check happens under the state lock, so two
//! concurrent start requests cannot both win. Hosts are handled one at a
//! time in discovery order. Failures local to one host (vendor lookup,
//! probe) are logged and skipped; anything else ends the run as `error`.
//! Writes committed before a failure are kept.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::classify::classify;
use crate::discover::HostDiscoverer;
use crate::error::{Error, Result};
use crate::netdetect::SubnetTarget;
use crate::probe::DeviceProber;
use crate::progress::ProgressChannel;
use crate::store::Store;
use crate::types::{
    DeviceSighting, Host, ProgressEvent, RunStatus, ScanPhase, ScanState, ScanStatus,
};
use crate::vendor::VendorLookup;

/// Outcome of a finished (or cancelled) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub scan_id: u64,
    pub status: RunStatus,
    pub hosts_discovered: usize,
    pub devices_found: u64,
    pub probe_failures: usize,
}

/// Result of asking for a background run.
#[derive(Debug)]
pub enum StartOutcome {
    Started(JoinHandle<Result<RunSummary>>),
    AlreadyRunning,
}

impl StartOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, StartOutcome::Started(_))
    }
}

/// Result of a foreground run.
#[derive(Debug)]
pub enum RunOutcome {
    Finished(RunSummary),
    AlreadyRunning,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    discoverer: Arc<dyn HostDiscoverer>,
    prober: Arc<dyn DeviceProber>,
    vendors: Arc<dyn VendorLookup>,
    progress: Arc<ProgressChannel>,
    default_subnet: SubnetTarget,
    state: RwLock<ScanState>,
    cancel: Mutex<Option<CancellationToken>>,
}

enum Ended {
    Completed { hosts: usize, probe_failures: usize },
    Cancelled { hosts: usize, probe_failures: usize },
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        discoverer: Arc<dyn HostDiscoverer>,
        prober: Arc<dyn DeviceProber>,
        vendors: Arc<dyn VendorLookup>,
        progress: Arc<ProgressChannel>,
        default_subnet: SubnetTarget,
    ) -> Self {
        Self {
            store,
            discoverer,
            prober,
            vendors,
            progress,
            default_subnet,
            state: RwLock::new(ScanState::default()),
            cancel: Mutex::new(None),
        }
    }

    /// Latest snapshot; a plain copy, readers never hold the lock.
    pub fn current_state(&self) -> ScanState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn progress(&self) -> &Arc<ProgressChannel> {
        &self.progress
    }

    pub fn is_running(&self) -> bool {
        self.current_state().status == ScanStatus::Running
    }

    /// Start a run in the background and return immediately.
    ///
    /// `subnet` of `None` uses the configured default. While another run is
    /// active this does nothing and reports [`StartOutcome::AlreadyRunning`].
    pub fn start(self: &Arc<Self>, subnet: Option<SubnetTarget>) -> StartOutcome {
        let Some(token) = self.try_begin() else {
            tracing::info!("Scan requested while another is running");
            return StartOutcome::AlreadyRunning;
        };
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let res = this.execute(subnet, token).await;
            if let Err(e) = &res {
                tracing::error!(error = %e, "Scan run failed");
            }
            res
        });
        StartOutcome::Started(handle)
    }

    /// Schedule-trigger entry point: start with defaults if idle.
    pub fn request_run(self: &Arc<Self>) -> bool {
        self.start(None).is_started()
    }

    /// Run the pipeline on the current task and wait for it.
    pub async fn run(&self, subnet: Option<SubnetTarget>) -> Result<RunOutcome> {
        let Some(token) = self.try_begin() else {
            return Ok(RunOutcome::AlreadyRunning);
        };
        self.execute(subnet, token).await.map(RunOutcome::Finished)
    }

    /// Ask the active run to stop at its next host boundary.
    pub fn cancel(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.cancel.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) => {
                token.cancel();
                tracing::info!("Scan cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Atomically flip idle/finished → running. `None` if already running.
    fn try_begin(&self) -> Option<CancellationToken> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.status == ScanStatus::Running {
            return None;
        }
        *state = ScanState {
            status: ScanStatus::Running,
            ..ScanState::default()
        };
        drop(state);

        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        Some(token)
    }

    /// Mutate the shared state, then publish the resulting snapshot.
    fn advance(&self, message: Option<String>, f: impl FnOnce(&mut ScanState)) -> ScanState {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            f(&mut state);
            state.clone()
        };
        let mut event = ProgressEvent::new(snapshot.clone());
        event.message = message;
        self.progress.publish(&event);
        snapshot
    }

    async fn execute(
        &self,
        subnet: Option<SubnetTarget>,
        token: CancellationToken,
    ) -> Result<RunSummary> {
        let target = subnet.unwrap_or_else(|| self.default_subnet.clone());

        let run = match self.store.create_run(OffsetDateTime::now_utc()).await {
            Ok(run) => run,
            Err(e) => {
                self.advance(Some(format!("Scan error: {e}")), |s| {
                    s.status = ScanStatus::Error;
                    s.error = Some(e.to_string());
                });
                return Err(e);
            }
        };
        tracing::info!(scan_id = run.id, target = %target, "Scan started");
        self.advance(None, |s| s.scan_id = Some(run.id));

        let outcome = self.pipeline(run.id, &target, &token).await;
        *self.cancel.lock().unwrap_or_else(|e| e.into_inner()) = None;

        match outcome {
            Ok(Ended::Completed { hosts, probe_failures }) => {
                self.complete(run.id, hosts, probe_failures, RunStatus::Done).await
            }
            Ok(Ended::Cancelled { hosts, probe_failures }) => {
                self.complete(run.id, hosts, probe_failures, RunStatus::Cancelled).await
            }
            Err(e) => {
                self.fail(run.id, &e).await;
                Err(e)
            }
        }
    }

    async fn pipeline(
        &self,
        scan_id: u64,
        target: &SubnetTarget,
        token: &CancellationToken,
    ) -> Result<Ended> {
        // Phase 1: discovery
        self.advance(Some("Starting network discovery...".into()), |s| {
            s.phase = Some(ScanPhase::Discover);
            s.current = 0;
            s.total = 0;
            s.device = None;
        });
        let found = |current: usize, total: usize, host: &Host| {
            self.advance(None, |s| {
                s.current = current as u64;
                s.total = total as u64;
                s.device = Some(host.ip.clone());
            });
        };
        let hosts = self.discoverer.discover(target, &found).await?;

        // Cancelled runs leave the online flags from the last census alone.
        if token.is_cancelled() {
            return Ok(Ended::Cancelled { hosts: hosts.len(), probe_failures: 0 });
        }
        let known = self.store.mark_all_offline().await?;
        tracing::info!(scan_id, hosts = hosts.len(), known, "Discovery finished");

        let total = hosts.len() as u64;

        // Phase 2: vendor lookup + device upsert
        self.advance(
            Some(format!("Found {total} hosts, looking up vendors...")),
            |s| {
                s.phase = Some(ScanPhase::Vendor);
                s.current = 0;
                s.total = total;
            },
        );
        for (i, host) in hosts.iter().enumerate() {
            if token.is_cancelled() {
                return Ok(Ended::Cancelled { hosts: hosts.len(), probe_failures: 0 });
            }
            let vendor = self.vendors.resolve(host.mac.as_deref()).await;
            self.advance(None, |s| {
                s.current = i as u64 + 1;
                s.device = Some(host.ip.clone());
            });
            self.reconcile_sighting(host, vendor).await?;
        }

        // Phase 3: port scan
        self.advance(Some("Scanning ports...".into()), |s| {
            s.phase = Some(ScanPhase::Portscan);
            s.current = 0;
            s.total = total;
        });
        let mut probe_failures = 0;
        for (i, host) in hosts.iter().enumerate() {
            if token.is_cancelled() {
                return Ok(Ended::Cancelled { hosts: hosts.len(), probe_failures });
            }
            self.advance(None, |s| {
                s.current = i as u64 + 1;
                s.device = Some(host.ip.clone());
            });
            if !self.probe_host(&host.ip).await? {
                probe_failures += 1;
            }
        }

        Ok(Ended::Completed { hosts: hosts.len(), probe_failures })
    }

    async fn reconcile_sighting(&self, host: &Host, vendor: Option<String>) -> Result<()> {
        let device = self
            .store
            .upsert_sighting(DeviceSighting {
                ip: host.ip.clone(),
                mac: host.mac.clone(),
                hostname: host.hostname.clone(),
                vendor,
                seen_at: OffsetDateTime::now_utc(),
            })
            .await?;
        tracing::debug!(ip = %device.ip, device_id = device.id, vendor = ?device.vendor, "Device upserted");
        Ok(())
    }

    /// Probe one host and store the findings. Returns `false` when the probe
    /// itself failed; store errors propagate.
    async fn probe_host(&self, ip: &str) -> Result<bool> {
        let result = match self.prober.probe(ip).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(ip = %ip, error = %e, "Probe failed, keeping previous ports");
                return Ok(false);
            }
        };

        let Some(device) = self.store.find_device_by_ip(ip).await? else {
            return Ok(true);
        };

        self.store
            .replace_ports(device.id, &result.ports, OffsetDateTime::now_utc())
            .await?;
        let category = classify(device.vendor.as_deref(), device.hostname.as_deref(), &result.ports);
        self.store
            .update_probe_fields(device.id, result.os.clone(), category)
            .await?;
        tracing::debug!(
            ip = %ip,
            open_ports = result.ports.iter().filter(|p| p.is_open()).count(),
            os = ?result.os,
            category = %category,
            "Device probed"
        );
        Ok(true)
    }

    /// Census, run bookkeeping and the final snapshot for a run that was not
    /// aborted by an error.
    async fn complete(
        &self,
        scan_id: u64,
        hosts: usize,
        probe_failures: usize,
        status: RunStatus,
    ) -> Result<RunSummary> {
        let finalize = async {
            if status == RunStatus::Done {
                let written = self.store.record_presence(scan_id, OffsetDateTime::now_utc()).await?;
                tracing::debug!(scan_id, written, "Presence census recorded");
            }
            let devices_found = self.store.count_online().await?;
            self.store
                .finish_run(scan_id, status, devices_found, None, OffsetDateTime::now_utc())
                .await?;
            Ok::<u64, Error>(devices_found)
        };
        let devices_found = match finalize.await {
            Ok(n) => n,
            Err(e) => {
                self.fail(scan_id, &e).await;
                return Err(e);
            }
        };

        let total = hosts as u64;
        if status == RunStatus::Done {
            self.advance(
                Some(format!("Scan complete. {devices_found} devices online.")),
                |s| {
                    s.status = ScanStatus::Done;
                    s.phase = Some(ScanPhase::Done);
                    s.current = total;
                    s.total = total;
                },
            );
            tracing::info!(scan_id, hosts, devices_found, probe_failures, "Scan finished");
        } else {
            self.advance(Some("Scan cancelled.".into()), |s| {
                s.status = ScanStatus::Cancelled;
            });
            tracing::info!(scan_id, hosts, devices_found, "Scan cancelled");
        }

        Ok(RunSummary {
            scan_id,
            status,
            hosts_discovered: hosts,
            devices_found,
            probe_failures,
        })
    }

    async fn fail(&self, scan_id: u64, err: &Error) {
        let message = err.to_string();
        if let Err(e) = self
            .store
            .finish_run(
                scan_id,
                RunStatus::Error,
                0,
                Some(message.clone()),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            tracing::error!(scan_id, error = %e, "Failed to record scan failure");
        }
        self.advance(Some(format!("Scan error: {message}")), |s| {
            s.status = ScanStatus::Error;
            s.error = Some(message);
        });
    }
}
