//! SQLite persistence for raw scans and computed metrics.
//!
//! rusqlite connections are not `Sync`, so a dedicated worker thread owns
//! the connection. Async callers submit closures over an mpsc channel and
//! await the reply on a oneshot; the thread applies them one at a time,
//! which also serializes writers without any further locking.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::metrics::WindowMetrics;
use crate::pulse::Pulse;
use crate::scan::ScanEvent;
use crate::shift::ShiftWindow;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS raw_scans (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    equipment_id  TEXT NOT NULL,
    serial_number TEXT NOT NULL,
    status        TEXT NOT NULL,
    scanned_at    TEXT NOT NULL,
    raw_data      TEXT,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (equipment_id, serial_number, scanned_at)
);

CREATE INDEX IF NOT EXISTS idx_raw_scans_equip_time
    ON raw_scans (equipment_id, scanned_at);

CREATE TABLE IF NOT EXISTS equipment_metrics (
    equipment_id        TEXT PRIMARY KEY,
    ct_equipo_hour      REAL,
    ct_proceso_hour     REAL,
    pieces_ok_hour      INTEGER NOT NULL DEFAULT 0,
    pieces_ng_hour      INTEGER NOT NULL DEFAULT 0,
    samples_hour        INTEGER NOT NULL DEFAULT 0,
    outliers_hour       INTEGER NOT NULL DEFAULT 0,
    stddev_hour         REAL NOT NULL DEFAULT 0,
    ct_equipo_shift     REAL,
    ct_proceso_shift    REAL,
    pieces_ok_shift     INTEGER NOT NULL DEFAULT 0,
    pieces_ng_shift     INTEGER NOT NULL DEFAULT 0,
    samples_shift       INTEGER NOT NULL DEFAULT 0,
    outliers_shift      INTEGER NOT NULL DEFAULT 0,
    stddev_shift        REAL NOT NULL DEFAULT 0,
    ct_equipo_realtime  REAL,
    ct_proceso_realtime REAL,
    last_serial         TEXT,
    last_scan_at        TEXT,
    shift_name          TEXT,
    shift_start         TEXT,
    calculated_at       TEXT
);
";

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

/// Batch insert accounting: rows written vs. rows the unique index dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub duplicates: usize,
}

/// One equipment's persisted metrics row, all three column groups.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRow {
    pub equipment_id: String,
    pub ct_equipo_hour: Option<f64>,
    pub ct_proceso_hour: Option<f64>,
    pub pieces_ok_hour: u32,
    pub pieces_ng_hour: u32,
    pub samples_hour: u32,
    pub outliers_hour: u32,
    pub stddev_hour: f64,
    pub ct_equipo_shift: Option<f64>,
    pub ct_proceso_shift: Option<f64>,
    pub pieces_ok_shift: u32,
    pub pieces_ng_shift: u32,
    pub samples_shift: u32,
    pub outliers_shift: u32,
    pub stddev_shift: f64,
    pub ct_equipo_realtime: Option<f64>,
    pub ct_proceso_realtime: Option<f64>,
    pub last_serial: Option<String>,
    pub last_scan_at: Option<NaiveDateTime>,
    pub shift_name: Option<String>,
    pub shift_start: Option<NaiveDateTime>,
    pub calculated_at: Option<NaiveDateTime>,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if self.sender.send(StoreCommand::Shutdown).is_err() {
                error!("store thread already gone at shutdown");
            }
            if handle.join().is_err() {
                error!("store thread panicked");
            }
        }
    }
}

/// Handle to the store worker. Cheap to clone; the connection closes when
/// the last clone drops.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (creating if needed) the database and runs the schema. Any
    /// failure here is fatal to startup: an agent without storage has
    /// nothing to aggregate from.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let db_path: PathBuf = path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("creating database directory {}", parent.display())
                })?;
            }
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("taktoor-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx
                            .send(Err(anyhow::Error::new(err).context("opening SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    warn!(error = %err, "failed to enable WAL mode");
                }

                let init = conn
                    .execute_batch(SCHEMA)
                    .context("initializing database schema");
                if ready_tx.send(init).is_err() {
                    error!("store caller dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                debug!("store thread shutting down");
            })
            .context("spawning store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!(path = %db_path.display(), "store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Runs a closure on the worker thread's connection.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("sending command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

    /// Inserts a scan batch, dropping rows the feed already delivered in an
    /// earlier extraction. Deduplication rides on the unique index over
    /// (equipment, serial, scanned_at).
    pub async fn insert_batch(&self, events: Vec<ScanEvent>) -> Result<InsertOutcome> {
        if events.is_empty() {
            return Ok(InsertOutcome::default());
        }

        self.execute(move |conn| {
            let tx = conn.transaction().context("opening insert transaction")?;
            let mut outcome = InsertOutcome::default();
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO raw_scans
                         (equipment_id, serial_number, status, scanned_at, raw_data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for event in &events {
                    let raw = event.metadata.as_ref().map(serde_json::Value::to_string);
                    let changed = stmt.execute(params![
                        event.equipment_id,
                        event.serial_number,
                        event.status,
                        event.timestamp,
                        raw,
                    ])?;
                    if changed > 0 {
                        outcome.inserted += 1;
                    } else {
                        outcome.duplicates += 1;
                    }
                }
            }
            tx.commit().context("committing scan batch")?;
            Ok(outcome)
        })
        .await
    }

    /// All scans for one equipment since `from`, oldest first.
    pub async fn scans_since(
        &self,
        equipment_id: &str,
        from: NaiveDateTime,
    ) -> Result<Vec<ScanEvent>> {
        let equipment_id = equipment_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT equipment_id, serial_number, status, scanned_at, raw_data
                 FROM raw_scans
                 WHERE equipment_id = ?1 AND scanned_at >= ?2
                 ORDER BY scanned_at ASC",
            )?;
            let rows = stmt.query_map(params![equipment_id, from], scan_from_row)?;

            let mut events = Vec::new();
            for row in rows {
                events.push(row.context("reading scan row")?);
            }
            Ok(events)
        })
        .await
    }

    /// Equipment ids that have at least one stored scan. The recompute set
    /// is the union of this and the configured registry, so equipment that
    /// appears in the feed before anyone registers it still gets metrics.
    pub async fn equipments_with_data(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT equipment_id FROM raw_scans ORDER BY equipment_id",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(row.context("reading equipment id")?);
            }
            Ok(ids)
        })
        .await
    }

    /// Upserts the hour and shift column groups for one equipment. The
    /// realtime columns belong to the pulse path and are never touched here.
    pub async fn update_window_metrics(
        &self,
        equipment_id: &str,
        hour: WindowMetrics,
        shift: WindowMetrics,
        shift_window: ShiftWindow,
        calculated_at: NaiveDateTime,
    ) -> Result<()> {
        let equipment_id = equipment_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO equipment_metrics (
                     equipment_id,
                     ct_equipo_hour, ct_proceso_hour, pieces_ok_hour, pieces_ng_hour,
                     samples_hour, outliers_hour, stddev_hour,
                     ct_equipo_shift, ct_proceso_shift, pieces_ok_shift, pieces_ng_shift,
                     samples_shift, outliers_shift, stddev_shift,
                     shift_name, shift_start, calculated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT (equipment_id) DO UPDATE SET
                     ct_equipo_hour = excluded.ct_equipo_hour,
                     ct_proceso_hour = excluded.ct_proceso_hour,
                     pieces_ok_hour = excluded.pieces_ok_hour,
                     pieces_ng_hour = excluded.pieces_ng_hour,
                     samples_hour = excluded.samples_hour,
                     outliers_hour = excluded.outliers_hour,
                     stddev_hour = excluded.stddev_hour,
                     ct_equipo_shift = excluded.ct_equipo_shift,
                     ct_proceso_shift = excluded.ct_proceso_shift,
                     pieces_ok_shift = excluded.pieces_ok_shift,
                     pieces_ng_shift = excluded.pieces_ng_shift,
                     samples_shift = excluded.samples_shift,
                     outliers_shift = excluded.outliers_shift,
                     stddev_shift = excluded.stddev_shift,
                     shift_name = excluded.shift_name,
                     shift_start = excluded.shift_start,
                     calculated_at = excluded.calculated_at",
                params![
                    equipment_id,
                    hour.equipment_ct,
                    hour.process_ct,
                    hour.pieces_ok,
                    hour.pieces_ng,
                    hour.valid_samples,
                    hour.outliers_removed,
                    hour.std_dev,
                    shift.equipment_ct,
                    shift.process_ct,
                    shift.pieces_ok,
                    shift.pieces_ng,
                    shift.valid_samples,
                    shift.outliers_removed,
                    shift.std_dev,
                    shift_window.name,
                    shift_window.start,
                    calculated_at,
                ],
            )
            .context("upserting window metrics")?;
            Ok(())
        })
        .await
    }

    /// Upserts the realtime column group for one equipment. The hour and
    /// shift columns belong to the recompute path and are never touched
    /// here.
    pub async fn update_pulse(&self, pulse: Pulse) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO equipment_metrics (
                     equipment_id, ct_equipo_realtime, ct_proceso_realtime,
                     last_serial, last_scan_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (equipment_id) DO UPDATE SET
                     ct_equipo_realtime = excluded.ct_equipo_realtime,
                     ct_proceso_realtime = excluded.ct_proceso_realtime,
                     last_serial = excluded.last_serial,
                     last_scan_at = excluded.last_scan_at",
                params![
                    pulse.equipment_id,
                    pulse.equipment_ct,
                    pulse.process_ct,
                    pulse.last_serial,
                    pulse.last_scan_at,
                ],
            )
            .context("upserting pulse metrics")?;
            Ok(())
        })
        .await
    }

    /// Reads one equipment's metrics row, if any cycle has written it yet.
    pub async fn metrics_row(&self, equipment_id: &str) -> Result<Option<MetricsRow>> {
        let equipment_id = equipment_id.to_string();
        self.execute(move |conn| {
            conn.query_row(
                "SELECT equipment_id,
                        ct_equipo_hour, ct_proceso_hour, pieces_ok_hour, pieces_ng_hour,
                        samples_hour, outliers_hour, stddev_hour,
                        ct_equipo_shift, ct_proceso_shift, pieces_ok_shift, pieces_ng_shift,
                        samples_shift, outliers_shift, stddev_shift,
                        ct_equipo_realtime, ct_proceso_realtime, last_serial, last_scan_at,
                        shift_name, shift_start, calculated_at
                 FROM equipment_metrics
                 WHERE equipment_id = ?1",
                params![equipment_id],
                metrics_from_row,
            )
            .optional()
            .context("reading metrics row")
        })
        .await
    }

    /// Prunes raw scans older than `days` by insertion time. Returns the
    /// number of rows removed.
    pub async fn delete_older_than(&self, days: u32) -> Result<usize> {
        self.execute(move |conn| {
            let modifier = format!("-{days} days");
            conn.execute(
                "DELETE FROM raw_scans WHERE created_at < datetime('now', ?1)",
                params![modifier],
            )
            .context("pruning raw scans")
        })
        .await
    }
}

fn scan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanEvent> {
    let raw: Option<String> = row.get(4)?;
    Ok(ScanEvent {
        equipment_id: row.get(0)?,
        serial_number: row.get(1)?,
        status: row.get(2)?,
        timestamp: row.get(3)?,
        metadata: raw.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn metrics_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsRow> {
    Ok(MetricsRow {
        equipment_id: row.get(0)?,
        ct_equipo_hour: row.get(1)?,
        ct_proceso_hour: row.get(2)?,
        pieces_ok_hour: row.get(3)?,
        pieces_ng_hour: row.get(4)?,
        samples_hour: row.get(5)?,
        outliers_hour: row.get(6)?,
        stddev_hour: row.get(7)?,
        ct_equipo_shift: row.get(8)?,
        ct_proceso_shift: row.get(9)?,
        pieces_ok_shift: row.get(10)?,
        pieces_ng_shift: row.get(11)?,
        samples_shift: row.get(12)?,
        outliers_shift: row.get(13)?,
        stddev_shift: row.get(14)?,
        ct_equipo_realtime: row.get(15)?,
        ct_proceso_realtime: row.get(16)?,
        last_serial: row.get(17)?,
        last_scan_at: row.get(18)?,
        shift_name: row.get(19)?,
        shift_start: row.get(20)?,
        calculated_at: row.get(21)?,
    })
}
