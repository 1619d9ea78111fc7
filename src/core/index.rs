//! Metadata index over agents, with a TTL-bound read cache.
//!
//! The index maps agent ids to their status, last verdict, and last update,
//! and carries the per-agent write-rate window. Aggregate read paths (status
//! summaries, reviewer candidate scans) go through a small in-process cache
//! that expires on a short TTL and is invalidated whenever the broker's write
//! generation moves, so cross-agent queries tolerate only bounded staleness.

use crate::core::broker::{self, DbBroker};
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::store::Store;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Cache time-to-live. Aggregate queries may be up to this much stale.
const CACHE_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub agent_id: String,
    pub status: String,
    pub last_verdict: Option<String>,
    pub last_update: Option<String>,
}

struct CacheState {
    fetched_at: Instant,
    generation: u64,
    root: std::path::PathBuf,
    entries: Vec<IndexEntry>,
}

fn cache() -> &'static Mutex<Option<CacheState>> {
    static CACHE: OnceLock<Mutex<Option<CacheState>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(None))
}

/// Upsert an agent's index row inside the caller's transaction, preserving
/// the rate-limit window columns.
pub fn upsert(
    conn: &Connection,
    agent_id: &str,
    status: &str,
    last_verdict: Option<&str>,
    last_update: &str,
) -> Result<(), VigilError> {
    conn.execute(
        "INSERT INTO agent_index(agent_id, status, last_verdict, last_update)
         VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(agent_id) DO UPDATE SET
             status = excluded.status,
             last_verdict = COALESCE(excluded.last_verdict, agent_index.last_verdict),
             last_update = excluded.last_update",
        params![agent_id, status, last_verdict, last_update],
    )?;
    Ok(())
}

/// Set only the status column (used by dialectic resolution and archival).
pub fn set_status(conn: &Connection, agent_id: &str, status: &str) -> Result<(), VigilError> {
    conn.execute(
        "UPDATE agent_index SET status = ?1 WHERE agent_id = ?2",
        params![status, agent_id],
    )?;
    Ok(())
}

/// Enforce the per-agent write-rate limit inside the caller's transaction.
/// Exceeding the limit is an explicit rejection, never a dropped write.
pub fn check_rate_limit(
    conn: &Connection,
    agent_id: &str,
    limit_per_minute: i64,
    now_secs: i64,
) -> Result<(), VigilError> {
    let row: Option<(i64, i64)> = conn
        .query_row(
            "SELECT window_start, window_count FROM agent_index WHERE agent_id = ?1",
            params![agent_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (window_start, window_count) = row.unwrap_or((0, 0));
    let (window_start, window_count) = if now_secs - window_start >= 60 {
        (now_secs, 0)
    } else {
        (window_start, window_count)
    };

    if window_count >= limit_per_minute {
        return Err(VigilError::ValidationError(format!(
            "write rate limit exceeded for agent '{}' ({} updates/min)",
            agent_id, limit_per_minute
        )));
    }

    conn.execute(
        "INSERT INTO agent_index(agent_id, status, window_start, window_count)
         VALUES(?1, 'active', ?2, ?3)
         ON CONFLICT(agent_id) DO UPDATE SET
             window_start = ?2,
             window_count = ?3",
        params![agent_id, window_start, window_count + 1],
    )?;
    Ok(())
}

/// List all index entries through the TTL cache.
pub fn list(store: &Store) -> Result<Vec<IndexEntry>, VigilError> {
    let generation = broker::write_generation();
    {
        let guard = cache()
            .lock()
            .map_err(|_| VigilError::ValidationError("index cache lock poisoned".to_string()))?;
        if let Some(state) = guard.as_ref() {
            if state.root == store.root
                && state.generation == generation
                && state.fetched_at.elapsed() < CACHE_TTL
            {
                return Ok(state.entries.clone());
            }
        }
    }

    let entries = list_uncached(store)?;
    let mut guard = cache()
        .lock()
        .map_err(|_| VigilError::ValidationError("index cache lock poisoned".to_string()))?;
    *guard = Some(CacheState {
        fetched_at: Instant::now(),
        generation,
        root: store.root.clone(),
        entries: entries.clone(),
    });
    Ok(entries)
}

fn list_uncached(store: &Store) -> Result<Vec<IndexEntry>, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    broker.with_read(&db_path, |conn| {
        let mut stmt = conn.prepare(
            "SELECT agent_id, status, last_verdict, last_update FROM agent_index ORDER BY agent_id",
        )?;
        let iter = stmt.query_map([], |row| {
            Ok(IndexEntry {
                agent_id: row.get(0)?,
                status: row.get(1)?,
                last_verdict: row.get(2)?,
                last_update: row.get(3)?,
            })
        })?;
        iter.collect::<Result<Vec<_>, _>>()
            .map_err(VigilError::RusqliteError)
    })
}

/// Fetch a single entry, bypassing the cache (used on authoritative paths).
pub fn get(store: &Store, agent_id: &str) -> Result<Option<IndexEntry>, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    broker.with_read(&db_path, |conn| {
        conn.query_row(
            "SELECT agent_id, status, last_verdict, last_update FROM agent_index WHERE agent_id = ?1",
            params![agent_id],
            |row| {
                Ok(IndexEntry {
                    agent_id: row.get(0)?,
                    status: row.get(1)?,
                    last_verdict: row.get(2)?,
                    last_update: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(VigilError::RusqliteError)
    })
}
