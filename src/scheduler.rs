//! Periodic auto-scan trigger.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::types::ScheduleConfig;

/// Longest accepted auto-scan interval: one year.
pub const MAX_INTERVAL_MINUTES: u64 = 365 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub interval_minutes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_run_at: Option<OffsetDateTime>,
}

/// Owns the timer task. Each tick asks the orchestrator for a run; a tick
/// that lands while a scan is active is a no-op. Reconfiguring restarts the
/// countdown.
pub struct Scheduler {
    store: Arc<dyn Store>,
    config_tx: watch::Sender<ScheduleConfig>,
    next_run: Arc<Mutex<Option<OffsetDateTime>>>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Load the stored schedule and start the timer task.
    pub async fn start(orchestrator: Arc<Orchestrator>, store: Arc<dyn Store>) -> Result<Self> {
        let stored = store.schedule().await?;
        let config = ScheduleConfig {
            interval_minutes: stored.interval_minutes.clamp(1, MAX_INTERVAL_MINUTES),
            ..stored
        };
        if config != stored {
            tracing::warn!(
                stored = stored.interval_minutes,
                applied = config.interval_minutes,
                "Stored scan interval out of range, clamped"
            );
        }
        let (config_tx, config_rx) = watch::channel(config);
        let next_run = Arc::new(Mutex::new(None));
        let task = tokio::spawn(timer_loop(orchestrator, config_rx, next_run.clone()));
        tracing::info!(
            enabled = config.enabled,
            interval_minutes = config.interval_minutes,
            "Scan schedule loaded"
        );
        Ok(Self {
            store,
            config_tx,
            next_run,
            task,
        })
    }

    pub fn status(&self) -> ScheduleStatus {
        let config = *self.config_tx.borrow();
        ScheduleStatus {
            enabled: config.enabled,
            interval_minutes: config.interval_minutes,
            next_run_at: *self.next_run.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Persist and apply a new schedule. Intervals below one minute are raised
    /// to one; intervals above [`MAX_INTERVAL_MINUTES`] are rejected before
    /// anything is stored.
    pub async fn configure(&self, config: ScheduleConfig) -> Result<ScheduleStatus> {
        if config.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(Error::Validation(format!(
                "interval_minutes must be at most {MAX_INTERVAL_MINUTES}, got {}",
                config.interval_minutes
            )));
        }
        let config = ScheduleConfig {
            interval_minutes: config.interval_minutes.max(1),
            ..config
        };
        self.store.set_schedule(config).await?;
        if config.enabled {
            // Report the new deadline right away rather than after the task wakes.
            *self.next_run.lock().unwrap_or_else(|e| e.into_inner()) = deadline(period(config));
        }
        self.config_tx.send_replace(config);
        tracing::info!(
            enabled = config.enabled,
            interval_minutes = config.interval_minutes,
            "Scan schedule updated"
        );
        Ok(self.status())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn period(config: ScheduleConfig) -> Duration {
    let minutes = config.interval_minutes.clamp(1, MAX_INTERVAL_MINUTES);
    Duration::from_secs(minutes.saturating_mul(60))
}

/// Wall-clock time `wait` from now, `None` if it cannot be represented.
fn deadline(wait: Duration) -> Option<OffsetDateTime> {
    let wait = time::Duration::try_from(wait).ok()?;
    OffsetDateTime::now_utc().checked_add(wait)
}

async fn timer_loop(
    orchestrator: Arc<Orchestrator>,
    mut config_rx: watch::Receiver<ScheduleConfig>,
    next_run: Arc<Mutex<Option<OffsetDateTime>>>,
) {
    let set_next = |at: Option<OffsetDateTime>| {
        *next_run.lock().unwrap_or_else(|e| e.into_inner()) = at;
    };

    loop {
        let config = *config_rx.borrow_and_update();
        if !config.enabled {
            set_next(None);
            if config_rx.changed().await.is_err() {
                break;
            }
            continue;
        }

        let wait = period(config);
        set_next(deadline(wait));
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if orchestrator.request_run() {
                    tracing::info!("Scheduled scan started");
                } else {
                    tracing::debug!("Scheduled scan skipped, a scan is already running");
                }
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}
