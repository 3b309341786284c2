use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Writes hitting SQLITE_BUSY are retried this many times before the event
/// is dropped and logged. The relay never waits on a contended store.
const BUSY_RETRIES: u32 = 3;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS feeders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    conn_type TEXT NOT NULL,
    ip_address TEXT,
    hostname TEXT,
    location TEXT,
    latitude REAL,
    longitude REAL,
    altitude REAL,
    tar1090_url TEXT,
    graphs1090_url TEXT,
    notes TEXT,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    bytes_received INTEGER NOT NULL DEFAULT 0,
    messages_received INTEGER NOT NULL DEFAULT 0,
    positions_received INTEGER NOT NULL DEFAULT 0,
    mlat_enabled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feeder_id INTEGER NOT NULL REFERENCES feeders(id) ON DELETE CASCADE,
    ip_address TEXT NOT NULL,
    connected_at TEXT NOT NULL,
    disconnected_at TEXT,
    duration_seconds INTEGER,
    bytes_transferred INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    event_type TEXT NOT NULL,
    feeder_id INTEGER,
    message TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS update_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_version TEXT,
    to_version TEXT,
    success INTEGER NOT NULL DEFAULT 0,
    output TEXT,
    timestamp TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_feeders_status ON feeders(status);
CREATE INDEX IF NOT EXISTS idx_connections_feeder ON connections(feeder_id);
CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("registry task cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// What a session learned about a feeder at classification time.
#[derive(Debug, Clone)]
pub struct FeederObservation {
    pub identity: String,
    pub conn_type: String,
    pub ip_address: String,
    pub hostname: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Display name used only when this identity has never been seen.
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct FeederRow {
    pub id: i64,
    pub identity: String,
    pub name: String,
    pub conn_type: String,
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
    pub location: Option<String>,
    pub status: String,
    pub first_seen: String,
    pub last_seen: String,
    pub bytes_received: i64,
    pub messages_received: i64,
    pub positions_received: i64,
    pub mlat_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionRow {
    pub id: i64,
    pub feeder_id: i64,
    pub ip_address: String,
    pub connected_at: String,
    pub disconnected_at: Option<String>,
    pub duration_seconds: Option<i64>,
    pub bytes_transferred: i64,
}

#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub feeder_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Connected,
    Disconnected,
    WentStale,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Connected => "feeder_connected",
            ActivityKind::Disconnected => "feeder_disconnected",
            ActivityKind::WentStale => "feeder_stale",
        }
    }
}

/// Durable mapping from feeder identity to accumulated state, plus the
/// per-session connection history and the append-only activity log.
///
/// The store is shared with an external reporting process: WAL journal mode
/// lets it read during our write transactions, and a bounded busy-timeout
/// keeps neither side waiting indefinitely. All rusqlite work runs on the
/// blocking pool; the handle is cheap to clone.
#[derive(Clone)]
pub struct FeederRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl FeederRegistry {
    pub fn open(path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout={};
             PRAGMA foreign_keys=ON;",
            busy_timeout_ms
        ))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert-or-update by identity. Returns the feeder row id. A returning
    /// feeder is re-marked `active` with a fresh `last_seen`; address,
    /// hostname, and location are refreshed when the observation has them.
    pub async fn upsert_feeder(&self, obs: FeederObservation) -> Result<i64> {
        self.run(move |conn| {
            busy_retry(|| {
                let tx = conn.unchecked_transaction()?;

                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM feeders WHERE identity = ?1",
                        params![obs.identity],
                        |row| row.get(0),
                    )
                    .optional()?;

                let id = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE feeders SET
                                ip_address = ?1,
                                conn_type = ?2,
                                hostname = COALESCE(?3, hostname),
                                location = COALESCE(?4, location),
                                latitude = COALESCE(?5, latitude),
                                longitude = COALESCE(?6, longitude),
                                last_seen = datetime('now'),
                                status = 'active',
                                updated_at = datetime('now')
                            WHERE id = ?7",
                            params![
                                obs.ip_address,
                                obs.conn_type,
                                obs.hostname,
                                obs.location,
                                obs.latitude,
                                obs.longitude,
                                id
                            ],
                        )?;
                        id
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO feeders
                                (identity, name, conn_type, ip_address, hostname,
                                 location, latitude, longitude,
                                 first_seen, last_seen, status, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                                 datetime('now'), datetime('now'), 'active',
                                 datetime('now'), datetime('now'))",
                            params![
                                obs.identity,
                                obs.name,
                                obs.conn_type,
                                obs.ip_address,
                                obs.hostname,
                                obs.location,
                                obs.latitude,
                                obs.longitude
                            ],
                        )?;
                        tx.last_insert_rowid()
                    }
                };

                tx.commit()?;
                Ok(id)
            })
        })
        .await
    }

    /// Open a connection record and log the `connected` activity event.
    pub async fn record_connection_open(&self, feeder_id: i64, ip: String) -> Result<i64> {
        self.run(move |conn| {
            busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT INTO connections (feeder_id, ip_address, connected_at)
                     VALUES (?1, ?2, datetime('now'))",
                    params![feeder_id, ip],
                )?;
                let connection_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO activity_log (event_type, feeder_id, message)
                     VALUES (?1, ?2, ?3)",
                    params![
                        ActivityKind::Connected.as_str(),
                        feeder_id,
                        format!("Feeder connected from {}", ip)
                    ],
                )?;
                tx.commit()?;
                Ok(connection_id)
            })
        })
        .await
    }

    /// Finalize a connection record: stamp disconnect time, compute duration,
    /// store the bytes this session carried, flip the feeder to `offline`,
    /// and log the `disconnected` event. Feeder byte counters are NOT bumped
    /// here; those flow exclusively through `increment_counters` so periodic
    /// flushes and the final flush never double-count.
    pub async fn record_connection_close(
        &self,
        connection_id: i64,
        feeder_id: i64,
        bytes_transferred: u64,
    ) -> Result<()> {
        self.run(move |conn| {
            busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "UPDATE connections SET
                        disconnected_at = datetime('now'),
                        duration_seconds = CAST(
                            round((julianday('now') - julianday(connected_at)) * 86400.0)
                            AS INTEGER),
                        bytes_transferred = ?1
                    WHERE id = ?2",
                    params![bytes_transferred as i64, connection_id],
                )?;
                tx.execute(
                    "UPDATE feeders SET
                        status = 'offline',
                        last_seen = datetime('now'),
                        updated_at = datetime('now')
                    WHERE id = ?1",
                    params![feeder_id],
                )?;
                tx.execute(
                    "INSERT INTO activity_log (event_type, feeder_id, message)
                     VALUES (?1, ?2, 'Feeder disconnected')",
                    params![ActivityKind::Disconnected.as_str(), feeder_id],
                )?;
                tx.commit()?;
                Ok(())
            })
        })
        .await
    }

    /// Bump traffic counters for an open session. Also refreshes `last_seen`
    /// and re-asserts `active` so a long-lived session never sweeps stale.
    pub async fn increment_counters(
        &self,
        feeder_id: i64,
        bytes: u64,
        messages: u64,
        positions: u64,
    ) -> Result<()> {
        self.run(move |conn| {
            busy_retry(|| {
                conn.execute(
                    "UPDATE feeders SET
                        bytes_received = bytes_received + ?1,
                        messages_received = messages_received + ?2,
                        positions_received = positions_received + ?3,
                        last_seen = datetime('now'),
                        status = 'active',
                        updated_at = datetime('now')
                    WHERE id = ?4",
                    params![bytes as i64, messages as i64, positions as i64, feeder_id],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// Refresh `last_seen` for a connected feeder that moved no data this
    /// flush interval.
    pub async fn touch_feeder(&self, feeder_id: i64) -> Result<()> {
        self.run(move |conn| {
            busy_retry(|| {
                conn.execute(
                    "UPDATE feeders SET
                        last_seen = datetime('now'),
                        status = 'active',
                        updated_at = datetime('now')
                    WHERE id = ?1",
                    params![feeder_id],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// Multilateration participation flag (written at the boundary; the mlat
    /// service itself lives outside this process).
    pub async fn set_mlat(&self, feeder_id: i64, enabled: bool) -> Result<()> {
        self.run(move |conn| {
            busy_retry(|| {
                conn.execute(
                    "UPDATE feeders SET mlat_enabled = ?1, updated_at = datetime('now')
                     WHERE id = ?2",
                    params![enabled as i64, feeder_id],
                )?;
                Ok(())
            })
        })
        .await
    }

    pub async fn log_activity(
        &self,
        kind: ActivityKind,
        feeder_id: Option<i64>,
        message: String,
    ) -> Result<()> {
        self.run(move |conn| {
            busy_retry(|| {
                conn.execute(
                    "INSERT INTO activity_log (event_type, feeder_id, message)
                     VALUES (?1, ?2, ?3)",
                    params![kind.as_str(), feeder_id, message],
                )?;
                Ok(())
            })
        })
        .await
    }

    /// Demote `active` feeders whose `last_seen` is older than the threshold,
    /// logging one activity event per demoted feeder. Returns how many rows
    /// flipped. `offline` and `stale` rows are never touched here.
    pub async fn mark_stale(&self, threshold_secs: u64) -> Result<u64> {
        self.run(move |conn| {
            busy_retry(|| {
                let cutoff = format!("-{} seconds", threshold_secs);
                let tx = conn.unchecked_transaction()?;

                let stale: Vec<(i64, String)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, name FROM feeders
                         WHERE status = 'active' AND last_seen < datetime('now', ?1)",
                    )?;
                    let rows = stmt
                        .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };

                for (id, name) in &stale {
                    tx.execute(
                        "UPDATE feeders SET status = 'stale', updated_at = datetime('now')
                         WHERE id = ?1 AND status = 'active'",
                        params![id],
                    )?;
                    tx.execute(
                        "INSERT INTO activity_log (event_type, feeder_id, message)
                         VALUES (?1, ?2, ?3)",
                        params![
                            ActivityKind::WentStale.as_str(),
                            id,
                            format!("Feeder {} went stale", name)
                        ],
                    )?;
                }

                tx.commit()?;
                Ok(stale.len() as u64)
            })
        })
        .await
    }

    /// Delete activity entries older than the retention window. Recent
    /// entries are never touched.
    pub async fn prune_activity(&self, retention_days: u32) -> Result<u64> {
        self.run(move |conn| {
            busy_retry(|| {
                let cutoff = format!("-{} days", retention_days);
                let deleted = conn.execute(
                    "DELETE FROM activity_log WHERE timestamp < datetime('now', ?1)",
                    params![cutoff],
                )?;
                Ok(deleted as u64)
            })
        })
        .await
    }

    /// Startup pass: a crash can leave connection rows with a NULL
    /// disconnect time. Close them now (duration measured to now) and flip
    /// their feeders to `offline`, since nothing is connected after a
    /// restart. Returns how many rows were reconciled.
    pub async fn reconcile_open_connections(&self) -> Result<u64> {
        self.run(move |conn| {
            busy_retry(|| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "UPDATE feeders SET status = 'offline', updated_at = datetime('now')
                     WHERE id IN (SELECT feeder_id FROM connections
                                  WHERE disconnected_at IS NULL)",
                    [],
                )?;
                let closed = tx.execute(
                    "UPDATE connections SET
                        disconnected_at = datetime('now'),
                        duration_seconds = CAST(
                            round((julianday('now') - julianday(connected_at)) * 86400.0)
                            AS INTEGER)
                    WHERE disconnected_at IS NULL",
                    [],
                )?;
                tx.commit()?;
                Ok(closed as u64)
            })
        })
        .await
    }

    // ── Read side (status line + reporting contract) ────────────────────────

    pub async fn feeder_by_identity(&self, identity: String) -> Result<Option<FeederRow>> {
        self.run(move |conn| {
            conn.query_row(
                &format!("{} WHERE identity = ?1", SELECT_FEEDER),
                params![identity],
                map_feeder,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn feeder_by_id(&self, id: i64) -> Result<Option<FeederRow>> {
        self.run(move |conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", SELECT_FEEDER),
                params![id],
                map_feeder,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn connection_by_id(&self, id: i64) -> Result<Option<ConnectionRow>> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, feeder_id, ip_address, connected_at, disconnected_at,
                        duration_seconds, bytes_transferred
                 FROM connections WHERE id = ?1",
                params![id],
                map_connection,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn open_connections(&self) -> Result<Vec<ConnectionRow>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, feeder_id, ip_address, connected_at, disconnected_at,
                        duration_seconds, bytes_transferred
                 FROM connections WHERE disconnected_at IS NULL
                 ORDER BY connected_at DESC",
            )?;
            let rows = stmt
                .query_map([], map_connection)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, event_type, feeder_id, message
                 FROM activity_log ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(ActivityRow {
                        timestamp: row.get(0)?,
                        event_type: row.get(1)?,
                        feeder_id: row.get(2)?,
                        message: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// (total, active, stale, offline) feeder counts for the status line.
    pub async fn status_counts(&self) -> Result<(u64, u64, u64, u64)> {
        self.run(move |conn| {
            let count = |status: Option<&str>| -> rusqlite::Result<u64> {
                match status {
                    Some(s) => conn.query_row(
                        "SELECT COUNT(*) FROM feeders WHERE status = ?1",
                        params![s],
                        |row| row.get(0),
                    ),
                    None => conn.query_row("SELECT COUNT(*) FROM feeders", [], |row| row.get(0)),
                }
            };
            Ok((
                count(None)?,
                count(Some("active"))?,
                count(Some("stale"))?,
                count(Some("offline"))?,
            ))
        })
        .await
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            op(&conn)
        })
        .await
        .map_err(|_| RegistryError::Cancelled)?
    }
}

const SELECT_FEEDER: &str = "SELECT id, identity, name, conn_type, ip_address, hostname,
        location, status, first_seen, last_seen,
        bytes_received, messages_received, positions_received, mlat_enabled
 FROM feeders";

fn map_feeder(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeederRow> {
    Ok(FeederRow {
        id: row.get(0)?,
        identity: row.get(1)?,
        name: row.get(2)?,
        conn_type: row.get(3)?,
        ip_address: row.get(4)?,
        hostname: row.get(5)?,
        location: row.get(6)?,
        status: row.get(7)?,
        first_seen: row.get(8)?,
        last_seen: row.get(9)?,
        bytes_received: row.get(10)?,
        messages_received: row.get(11)?,
        positions_received: row.get(12)?,
        mlat_enabled: row.get::<_, i64>(13)? != 0,
    })
}

fn map_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRow> {
    Ok(ConnectionRow {
        id: row.get(0)?,
        feeder_id: row.get(1)?,
        ip_address: row.get(2)?,
        connected_at: row.get(3)?,
        disconnected_at: row.get(4)?,
        duration_seconds: row.get(5)?,
        bytes_transferred: row.get(6)?,
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn busy_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(RegistryError::Sqlite(ref e)) if is_busy(e) && attempt + 1 < BUSY_RETRIES => {
                attempt += 1;
                std::thread::sleep(BUSY_RETRY_DELAY);
            }
            result => return result,
        }
    }
}
