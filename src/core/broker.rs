//! The DB Broker is the thin waist for state access.
//!
//! Every mutation routes through `with_write`, which:
//! - serializes write access per database via an in-process mutex
//! - runs the closure inside a single IMMEDIATE transaction, committed only
//!   when the closure succeeds
//! - appends an audit line to `broker.events.jsonl`
//! - bumps the write generation so TTL caches in front of the metadata index
//!   are invalidated on every write
//!
//! Reads go through `with_read` without mutex serialization; WAL mode allows
//! concurrent readers across threads and processes. Connections are opened
//! fresh per operation to avoid WAL/SHM handle conflicts with child processes.

use crate::core::db;
use crate::core::error::VigilError;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for busy/locked errors.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 50;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 2_000;

/// Write connection busy_timeout in seconds.
const WRITE_BUSY_TIMEOUT_SECS: u64 = 5;
/// Read connection busy_timeout in seconds.
const READ_BUSY_TIMEOUT_SECS: u64 = 5;

static WRITE_GENERATION: AtomicU64 = AtomicU64::new(0);

/// Current write generation. Caches snapshot this value and treat any change
/// as an invalidation.
pub fn write_generation() -> u64 {
    WRITE_GENERATION.load(Ordering::Acquire)
}

struct PoolEntry {
    write_lock: Mutex<()>,
    db_path: PathBuf,
}

fn pool_entry(db_path: &Path) -> Result<&'static PoolEntry, VigilError> {
    static ENTRIES: OnceLock<Mutex<HashMap<PathBuf, &'static PoolEntry>>> = OnceLock::new();
    let entries = ENTRIES.get_or_init(|| Mutex::new(HashMap::new()));
    let canonical = db_path.to_path_buf();
    let mut entries = entries
        .lock()
        .map_err(|_| VigilError::ValidationError("broker pool lock poisoned".to_string()))?;
    if let Some(entry) = entries.get(&canonical) {
        return Ok(*entry);
    }
    let entry = Box::leak(Box::new(PoolEntry {
        write_lock: Mutex::new(()),
        db_path: canonical.clone(),
    }));
    entries.insert(canonical, entry);
    Ok(entry)
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

pub struct DbBroker {
    audit_log_path: PathBuf,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join("broker.events.jsonl"),
        }
    }

    /// Execute a closure with a serialized write connection. Write access is
    /// serialized per-DB via mutex; busy errors are retried with backoff.
    pub fn with_write<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, VigilError>
    where
        F: FnOnce(&Connection) -> Result<R, VigilError>,
    {
        let entry = pool_entry(db_path)?;
        let _guard = entry
            .write_lock
            .lock()
            .map_err(|_| VigilError::ValidationError("broker write lock poisoned".to_string()))?;

        let conn = db::db_connect_with_timeout(
            &entry.db_path.to_string_lossy(),
            WRITE_BUSY_TIMEOUT_SECS,
        )?;
        // One IMMEDIATE transaction per write: the closure's statements land
        // together or not at all, and the write lock is taken up front.
        let result = conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(VigilError::RusqliteError)
            .and_then(|_| f(&conn))
            .and_then(|value| {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            });
        if result.is_err() {
            let _ = conn.execute_batch("ROLLBACK");
        }

        let status = if result.is_ok() { "success" } else { "error" };
        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        self.log_event(actor, op_name, &db_id, status)?;

        if result.is_ok() {
            WRITE_GENERATION.fetch_add(1, Ordering::Release);
        }
        result
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, db_path: &Path, f: F) -> Result<R, VigilError>
    where
        F: FnOnce(&Connection) -> Result<R, VigilError>,
    {
        let conn =
            db::db_connect_with_timeout(&db_path.to_string_lossy(), READ_BUSY_TIMEOUT_SECS)?;
        f(&conn)
    }

    fn log_event(
        &self,
        actor: &str,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), VigilError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(VigilError::IoError)?;
        let line = serde_json::to_string(&ev)
            .map_err(|e| VigilError::ValidationError(format!("audit serialize: {e}")))?;
        writeln!(f, "{}", line).map_err(VigilError::IoError)?;
        Ok(())
    }
}

/// Retry a closure on retryable busy errors with exponential backoff.
pub fn retry_on_busy<F, R>(mut f: F) -> Result<R, VigilError>
where
    F: FnMut() -> Result<R, VigilError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_error(&e) && attempt < MAX_RETRIES => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_busy_error(err: &VigilError) -> bool {
    match err {
        VigilError::BusyError(_) => true,
        VigilError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
