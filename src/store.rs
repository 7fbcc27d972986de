//! Inventory persistence.
//!
//! [`Store`] is the seam the orchestrator and HTTP layer write through. Each
//! method is one committed statement or transaction: once it returns Ok,
//! subsequent reads see the change, and when it returns Err nothing it
//! touched is kept. [`SqliteStore`] is the SQLite implementation.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::netdetect::ip_sort_key;
use crate::types::{
    non_empty, Category, Device, DevicePatch, DeviceSighting, Port, PortFinding, PresenceRecord,
    RunStatus, ScanRun, ScheduleConfig,
};

/// Max presence records returned for one device.
pub const HISTORY_LIMIT: usize = 50;

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn get_device(&self, id: u64) -> Result<Option<Device>>;
    async fn find_device_by_ip(&self, ip: &str) -> Result<Option<Device>>;

    /// Insert or merge a sighting by address. Non-empty fields overwrite,
    /// empty ones keep the stored value. The device ends up online.
    async fn upsert_sighting(&self, sighting: DeviceSighting) -> Result<Device>;

    /// Clear the online flag on every device; returns how many were known.
    async fn mark_all_offline(&self) -> Result<usize>;

    /// Swap the device's whole port set for the open findings given.
    async fn replace_ports(
        &self,
        device_id: u64,
        findings: &[PortFinding],
        seen_at: OffsetDateTime,
    ) -> Result<()>;

    /// Store probe-derived fields. `os` of `None` keeps the old label.
    async fn update_probe_fields(
        &self,
        device_id: u64,
        os: Option<String>,
        icon_type: Category,
    ) -> Result<()>;

    async fn patch_device(&self, id: u64, patch: DevicePatch) -> Result<Device>;

    async fn create_run(&self, started_at: OffsetDateTime) -> Result<ScanRun>;
    async fn finish_run(
        &self,
        id: u64,
        status: RunStatus,
        devices_found: u64,
        error_msg: Option<String>,
        finished_at: OffsetDateTime,
    ) -> Result<ScanRun>;
    async fn list_runs(&self, limit: usize) -> Result<Vec<ScanRun>>;

    /// One presence row per known device for `scan_id`, all sharing `scanned_at`.
    async fn record_presence(&self, scan_id: u64, scanned_at: OffsetDateTime) -> Result<usize>;
    async fn presence_for_run(&self, scan_id: u64) -> Result<Vec<PresenceRecord>>;
    async fn device_history(&self, device_id: u64, limit: usize) -> Result<Vec<PresenceRecord>>;

    async fn count_online(&self) -> Result<u64>;

    async fn schedule(&self) -> Result<ScheduleConfig>;
    async fn set_schedule(&self, config: ScheduleConfig) -> Result<ScheduleConfig>;
}

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS devices (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    ip          TEXT NOT NULL UNIQUE,
    mac         TEXT,
    hostname    TEXT,
    vendor      TEXT,
    os          TEXT,
    nickname    TEXT,
    icon_type   TEXT NOT NULL DEFAULT 'device',
    tags        TEXT NOT NULL DEFAULT '[]',
    first_seen  INTEGER NOT NULL,
    last_seen   INTEGER NOT NULL,
    is_online   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ports (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    port        INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    protocol    TEXT NOT NULL,
    service     TEXT,
    version     TEXT,
    state       TEXT NOT NULL,
    last_seen   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ports_device ON ports(device_id);

CREATE TABLE IF NOT EXISTS scan_runs (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at     INTEGER NOT NULL,
    finished_at    INTEGER,
    devices_found  INTEGER NOT NULL DEFAULT 0,
    status         TEXT NOT NULL,
    error_msg      TEXT
);

CREATE TABLE IF NOT EXISTS presence (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id   INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    scan_id     INTEGER NOT NULL REFERENCES scan_runs(id),
    scanned_at  INTEGER NOT NULL,
    is_online   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_presence_device ON presence(device_id, scanned_at);
CREATE INDEX IF NOT EXISTS idx_presence_scan ON presence(scan_id);

CREATE TABLE IF NOT EXISTS schedule (
    id                INTEGER PRIMARY KEY CHECK (id = 1),
    enabled           INTEGER NOT NULL,
    interval_minutes  INTEGER NOT NULL
);
";

const DEVICE_COLUMNS: &str =
    "id, ip, mac, hostname, vendor, os, nickname, icon_type, tags, first_seen, last_seen, is_online";
const PORT_COLUMNS: &str = "id, device_id, port, protocol, service, version, state, last_seen";
const RUN_COLUMNS: &str = "id, started_at, finished_at, devices_found, status, error_msg";
const PRESENCE_COLUMNS: &str = "id, device_id, scan_id, scanned_at, is_online";

/// Inventory database backed by SQLite.
///
/// The connection sits behind a mutex and every call runs on the blocking
/// pool, so the async runtime never waits on disk I/O.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::initialize(conn)?;
        tracing::info!(path = %path.display(), "Inventory database opened");
        Ok(store)
    }

    /// In-memory database, gone when the store is dropped.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {e}")))?
    }
}

fn ts(t: OffsetDateTime) -> i64 {
    i64::try_from(t.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let nanos: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)? as u64)
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let tags: String = row.get(8)?;
    let tags = serde_json::from_str(&tags)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(e)))?;
    Ok(Device {
        id: id_col(row, 0)?,
        ip: row.get(1)?,
        mac: row.get(2)?,
        hostname: row.get(3)?,
        vendor: row.get(4)?,
        os: row.get(5)?,
        nickname: row.get(6)?,
        icon_type: enum_col(row, 7)?,
        tags,
        first_seen: ts_col(row, 9)?,
        last_seen: ts_col(row, 10)?,
        is_online: row.get(11)?,
        ports: Vec::new(),
    })
}

fn port_from_row(row: &Row<'_>) -> rusqlite::Result<Port> {
    Ok(Port {
        id: id_col(row, 0)?,
        device_id: id_col(row, 1)?,
        port: row.get(2)?,
        protocol: row.get(3)?,
        service: row.get(4)?,
        version: row.get(5)?,
        state: enum_col(row, 6)?,
        last_seen: ts_col(row, 7)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRun> {
    Ok(ScanRun {
        id: id_col(row, 0)?,
        started_at: ts_col(row, 1)?,
        finished_at: opt_ts_col(row, 2)?,
        devices_found: row.get::<_, i64>(3)? as u64,
        status: enum_col(row, 4)?,
        error_msg: row.get(5)?,
    })
}

fn presence_from_row(row: &Row<'_>) -> rusqlite::Result<PresenceRecord> {
    Ok(PresenceRecord {
        id: id_col(row, 0)?,
        device_id: id_col(row, 1)?,
        scan_id: id_col(row, 2)?,
        scanned_at: ts_col(row, 3)?,
        is_online: row.get(4)?,
    })
}

fn load_device(conn: &Connection, id: u64) -> Result<Option<Device>> {
    let device = conn
        .query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            params![id as i64],
            device_from_row,
        )
        .optional()?;
    let Some(mut device) = device else {
        return Ok(None);
    };
    let mut stmt =
        conn.prepare(&format!("SELECT {PORT_COLUMNS} FROM ports WHERE device_id = ?1 ORDER BY port"))?;
    device.ports = stmt
        .query_map(params![id as i64], port_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    Ok(Some(device))
}

fn require_device(conn: &Connection, id: u64) -> Result<Device> {
    load_device(conn, id)?.ok_or_else(|| Error::NotFound(format!("device {id}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices"))?;
            let mut devices: Vec<Device> = stmt
                .query_map([], device_from_row)?
                .collect::<rusqlite::Result<_>>()?;

            let mut stmt =
                conn.prepare(&format!("SELECT {PORT_COLUMNS} FROM ports ORDER BY device_id, port"))?;
            let mut ports: HashMap<u64, Vec<Port>> = HashMap::new();
            for port in stmt.query_map([], port_from_row)? {
                let port = port?;
                ports.entry(port.device_id).or_default().push(port);
            }

            for device in &mut devices {
                device.ports = ports.remove(&device.id).unwrap_or_default();
            }
            devices.sort_by_key(|d| ip_sort_key(&d.ip));
            Ok(devices)
        })
        .await
    }

    async fn get_device(&self, id: u64) -> Result<Option<Device>> {
        self.with_conn(move |conn| load_device(conn, id)).await
    }

    async fn find_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        let ip = ip.to_string();
        self.with_conn(move |conn| {
            let id: Option<i64> = conn
                .query_row("SELECT id FROM devices WHERE ip = ?1", params![ip], |r| r.get(0))
                .optional()?;
            match id {
                Some(id) => load_device(conn, id as u64),
                None => Ok(None),
            }
        })
        .await
    }

    async fn upsert_sighting(&self, sighting: DeviceSighting) -> Result<Device> {
        self.with_conn(move |conn| {
            let DeviceSighting {
                ip,
                mac,
                hostname,
                vendor,
                seen_at,
            } = sighting;
            let (mac, hostname, vendor) = (non_empty(mac), non_empty(hostname), non_empty(vendor));
            let seen_at = ts(seen_at);

            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row("SELECT id FROM devices WHERE ip = ?1", params![ip], |r| r.get(0))
                .optional()?;
            let id = match existing {
                Some(id) => {
                    tx.execute(
                        "UPDATE devices SET mac = COALESCE(?1, mac), hostname = COALESCE(?2, hostname), \
                         vendor = COALESCE(?3, vendor), is_online = 1, last_seen = ?4 WHERE id = ?5",
                        params![mac, hostname, vendor, seen_at, id],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO devices (ip, mac, hostname, vendor, icon_type, tags, first_seen, \
                         last_seen, is_online) VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?6, 1)",
                        params![ip, mac, hostname, vendor, Category::Device.as_str(), seen_at],
                    )?;
                    tx.last_insert_rowid()
                }
            };
            let device = require_device(&tx, id as u64)?;
            tx.commit()?;
            Ok(device)
        })
        .await
    }

    async fn mark_all_offline(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let known: i64 = tx.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0))?;
            tx.execute("UPDATE devices SET is_online = 0", [])?;
            tx.commit()?;
            Ok(known as usize)
        })
        .await
    }

    async fn replace_ports(
        &self,
        device_id: u64,
        findings: &[PortFinding],
        seen_at: OffsetDateTime,
    ) -> Result<()> {
        let findings: Vec<PortFinding> = findings.iter().filter(|f| f.is_open()).cloned().collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_device(&tx, device_id)?;
            tx.execute("DELETE FROM ports WHERE device_id = ?1", params![device_id as i64])?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO ports (device_id, port, protocol, service, version, state, last_seen) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for f in &findings {
                    insert.execute(params![
                        device_id as i64,
                        f.port,
                        f.protocol,
                        f.service,
                        f.version,
                        f.state.as_str(),
                        ts(seen_at),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_probe_fields(
        &self,
        device_id: u64,
        os: Option<String>,
        icon_type: Category,
    ) -> Result<()> {
        let os = non_empty(os);
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE devices SET os = COALESCE(?1, os), icon_type = ?2 WHERE id = ?3",
                params![os, icon_type.as_str(), device_id as i64],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("device {device_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn patch_device(&self, id: u64, patch: DevicePatch) -> Result<Device> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_device(&tx, id)?;
            if let Some(nickname) = patch.nickname {
                tx.execute("UPDATE devices SET nickname = ?1 WHERE id = ?2", params![nickname, id as i64])?;
            }
            if let Some(tags) = patch.tags {
                let tags = serde_json::to_string(&tags)?;
                tx.execute("UPDATE devices SET tags = ?1 WHERE id = ?2", params![tags, id as i64])?;
            }
            if let Some(icon_type) = patch.icon_type {
                tx.execute(
                    "UPDATE devices SET icon_type = ?1 WHERE id = ?2",
                    params![icon_type.as_str(), id as i64],
                )?;
            }
            let device = require_device(&tx, id)?;
            tx.commit()?;
            Ok(device)
        })
        .await
    }

    async fn create_run(&self, started_at: OffsetDateTime) -> Result<ScanRun> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scan_runs (started_at, status) VALUES (?1, ?2)",
                params![ts(started_at), RunStatus::Running.as_str()],
            )?;
            Ok(ScanRun {
                id: conn.last_insert_rowid() as u64,
                started_at,
                finished_at: None,
                devices_found: 0,
                status: RunStatus::Running,
                error_msg: None,
            })
        })
        .await
    }

    async fn finish_run(
        &self,
        id: u64,
        status: RunStatus,
        devices_found: u64,
        error_msg: Option<String>,
        finished_at: OffsetDateTime,
    ) -> Result<ScanRun> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE scan_runs SET status = ?1, devices_found = ?2, error_msg = ?3, finished_at = ?4 \
                 WHERE id = ?5",
                params![status.as_str(), devices_found as i64, error_msg, ts(finished_at), id as i64],
            )?;
            if changed == 0 {
                return Err(Error::NotFound(format!("scan run {id}")));
            }
            Ok(conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM scan_runs WHERE id = ?1"),
                params![id as i64],
                run_from_row,
            )?)
        })
        .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<ScanRun>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM scan_runs ORDER BY id DESC LIMIT ?1"
            ))?;
            let runs = stmt
                .query_map(params![limit], run_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            Ok(runs)
        })
        .await
    }

    async fn record_presence(&self, scan_id: u64, scanned_at: OffsetDateTime) -> Result<usize> {
        self.with_conn(move |conn| {
            let written = conn.execute(
                "INSERT INTO presence (device_id, scan_id, scanned_at, is_online) \
                 SELECT id, ?1, ?2, is_online FROM devices",
                params![scan_id as i64, ts(scanned_at)],
            )?;
            Ok(written)
        })
        .await
    }

    async fn presence_for_run(&self, scan_id: u64) -> Result<Vec<PresenceRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRESENCE_COLUMNS} FROM presence WHERE scan_id = ?1 ORDER BY id"
            ))?;
            let records = stmt
                .query_map(params![scan_id as i64], presence_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            Ok(records)
        })
        .await
    }

    async fn device_history(&self, device_id: u64, limit: usize) -> Result<Vec<PresenceRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PRESENCE_COLUMNS} FROM presence WHERE device_id = ?1 \
                 ORDER BY scanned_at DESC, id DESC LIMIT ?2"
            ))?;
            let records = stmt
                .query_map(params![device_id as i64, limit], presence_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            Ok(records)
        })
        .await
    }

    async fn count_online(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM devices WHERE is_online = 1", [], |r| r.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    async fn schedule(&self) -> Result<ScheduleConfig> {
        self.with_conn(|conn| {
            let stored = conn
                .query_row(
                    "SELECT enabled, interval_minutes FROM schedule WHERE id = 1",
                    [],
                    |r| {
                        Ok(ScheduleConfig {
                            enabled: r.get(0)?,
                            interval_minutes: r.get::<_, i64>(1)?.max(0) as u64,
                        })
                    },
                )
                .optional()?;
            Ok(stored.unwrap_or_default())
        })
        .await
    }

    async fn set_schedule(&self, config: ScheduleConfig) -> Result<ScheduleConfig> {
        let minutes = i64::try_from(config.interval_minutes)
            .map_err(|_| Error::Validation(format!("interval {} is too large", config.interval_minutes)))?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO schedule (id, enabled, interval_minutes) VALUES (1, ?1, ?2)",
                params![config.enabled, minutes],
            )?;
            Ok(config)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortState;

    fn sighting(ip: &str, mac: Option<&str>, hostname: Option<&str>, vendor: Option<&str>) -> DeviceSighting {
        DeviceSighting {
            ip: ip.into(),
            mac: mac.map(Into::into),
            hostname: hostname.map(Into::into),
            vendor: vendor.map(Into::into),
            seen_at: OffsetDateTime::now_utc(),
        }
    }

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn upsert_keeps_existing_fields_when_new_values_are_empty() {
        let store = store();
        let first = store
            .upsert_sighting(sighting("10.0.0.2", Some("AA:BB:CC:00:11:22"), Some("nas"), Some("Synology")))
            .await
            .unwrap();
        store.mark_all_offline().await.unwrap();

        let second = store
            .upsert_sighting(sighting("10.0.0.2", None, Some(""), None))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.mac.as_deref(), Some("AA:BB:CC:00:11:22"));
        assert_eq!(second.hostname.as_deref(), Some("nas"));
        assert_eq!(second.vendor.as_deref(), Some("Synology"));
        assert!(second.is_online);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[tokio::test]
    async fn replace_ports_keeps_only_open_findings() {
        let store = store();
        let device = store.upsert_sighting(sighting("10.0.0.3", None, None, None)).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .replace_ports(device.id, &[PortFinding::open_tcp(22), PortFinding::open_tcp(80)], now)
            .await
            .unwrap();

        let mut closed = PortFinding::open_tcp(443);
        closed.state = PortState::Closed;
        store
            .replace_ports(device.id, &[PortFinding::open_tcp(8080), closed], now)
            .await
            .unwrap();

        let stored = store.get_device(device.id).await.unwrap().unwrap();
        let ports: Vec<u16> = stored.ports.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![8080]);
    }

    #[tokio::test]
    async fn failed_port_replacement_rolls_back() {
        let store = store();
        let device = store.upsert_sighting(sighting("10.0.0.6", None, None, None)).await.unwrap();
        let now = OffsetDateTime::now_utc();
        store
            .replace_ports(device.id, &[PortFinding::open_tcp(22), PortFinding::open_tcp(443)], now)
            .await
            .unwrap();

        // Port 0 violates the table constraint after the delete and the first insert ran.
        let err = store
            .replace_ports(device.id, &[PortFinding::open_tcp(8080), PortFinding::open_tcp(0)], now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        let stored = store.get_device(device.id).await.unwrap().unwrap();
        let ports: Vec<u16> = stored.ports.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![22, 443]);
    }

    #[tokio::test]
    async fn replace_ports_on_missing_device_writes_nothing() {
        let store = store();
        let err = store
            .replace_ports(42, &[PortFinding::open_tcp(22)], OffsetDateTime::now_utc())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(store.list_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let store = store();
        let device = store.upsert_sighting(sighting("10.0.0.4", None, None, None)).await.unwrap();
        let base = OffsetDateTime::now_utc();
        for i in 0..3 {
            let run = store.create_run(base).await.unwrap();
            store
                .record_presence(run.id, base + time::Duration::minutes(i))
                .await
                .unwrap();
        }
        let history = store.device_history(device.id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].scanned_at > history[1].scanned_at);
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first() {
        let store = store();
        let first = store.create_run(OffsetDateTime::now_utc()).await.unwrap();
        let second = store.create_run(OffsetDateTime::now_utc()).await.unwrap();
        let finished = store
            .finish_run(first.id, RunStatus::Error, 0, Some("boom".into()), OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(finished.status, RunStatus::Error);
        assert!(finished.finished_at.is_some());

        let runs = store.list_runs(10).await.unwrap();
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(runs[1].error_msg.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn database_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let device = store.upsert_sighting(sighting("10.0.0.5", None, Some("tv"), None)).await.unwrap();
            store
                .patch_device(
                    device.id,
                    DevicePatch {
                        tags: Some(vec!["living-room".into()]),
                        ..DevicePatch::default()
                    },
                )
                .await
                .unwrap();
            store
                .set_schedule(ScheduleConfig { enabled: true, interval_minutes: 15 })
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        let devices = reopened.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].hostname.as_deref(), Some("tv"));
        assert_eq!(devices[0].tags, vec!["living-room".to_string()]);
        let schedule = reopened.schedule().await.unwrap();
        assert!(schedule.enabled);
        assert_eq!(schedule.interval_minutes, 15);
    }

    #[tokio::test]
    async fn patch_on_missing_device_is_not_found() {
        let store = store();
        let err = store.patch_device(99, DevicePatch::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
