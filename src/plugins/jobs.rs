//! Background maintenance jobs.
//!
//! Three jobs run on fixed cadences independent of request traffic: stale
//! lease reclamation, calibration backfill, and dialectic session timeout
//! sweeps. Each job takes its own `job/<name>` lease with zero wait, so an
//! overlapping run skips instead of double-processing, and records its last
//! run in the meta table to honor its cadence.

use crate::core::broker::DbBroker;
use crate::core::config::VigilConfig;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::lease::{self, Lease};
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job lease TTL: generous enough for a slow sweep, short enough that a
/// crashed run frees the job quickly.
const JOB_LEASE_TTL: i64 = 120;

const REAPER_INTERVAL_SECS: i64 = 30;
const BACKFILL_INTERVAL_SECS: i64 = 300;
const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub ran: bool,
    pub detail: String,
}

fn last_run(store: &Store, job: &str) -> Result<i64, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let key = format!("job.last_run.{job}");
    broker.with_read(&db_path, |conn| {
        let v: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .optional()?;
        Ok(v.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
    })
}

fn mark_run(store: &Store, job: &str) -> Result<(), VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let key = format!("job.last_run.{job}");
    broker.with_write(&db_path, "vigil", "jobs.mark", |conn| {
        conn.execute(
            "INSERT OR REPLACE INTO meta(key, value) VALUES(?1, ?2)",
            params![key, time::now_secs().to_string()],
        )?;
        Ok(())
    })
}

/// Run one job under its re-entrancy lease. A held lease or an unexpired
/// cadence both report `ran: false` rather than erroring.
fn run_guarded<F>(
    store: &Store,
    job: &str,
    interval_secs: i64,
    force: bool,
    body: F,
) -> Result<JobReport, VigilError>
where
    F: FnOnce() -> Result<String, VigilError>,
{
    if !force && time::now_secs() - last_run(store, job)? < interval_secs {
        return Ok(JobReport {
            job: job.to_string(),
            ran: false,
            detail: "cadence not due".to_string(),
        });
    }

    let holder = format!("vigil:{}", time::new_event_id());
    let guard = match Lease::acquire(
        store,
        &format!("job/{job}"),
        &holder,
        JOB_LEASE_TTL,
        Duration::ZERO,
    ) {
        Ok(lease) => lease,
        Err(VigilError::BusyError(_)) => {
            return Ok(JobReport {
                job: job.to_string(),
                ran: false,
                detail: "already running".to_string(),
            });
        }
        Err(e) => return Err(e),
    };

    // Record the run while still holding the guard; releasing first would
    // let a second runner start before the cadence mark lands.
    let result = body().and_then(|detail| {
        mark_run(store, job)?;
        Ok(detail)
    });
    guard.release()?;
    let detail = result?;
    Ok(JobReport {
        job: job.to_string(),
        ran: true,
        detail,
    })
}

/// Run every due job. `force` ignores cadence (but never the re-entrancy
/// guard).
pub fn run_due(store: &Store, cfg: &VigilConfig, force: bool) -> Result<Vec<JobReport>, VigilError> {
    let mut reports = Vec::new();

    reports.push(run_guarded(store, "lease_reaper", REAPER_INTERVAL_SECS, force, || {
        let reclaimed = lease::reap_stale(store)?;
        Ok(format!("reclaimed {reclaimed} stale lease(s)"))
    })?);

    reports.push(run_guarded(
        store,
        "calibration_backfill",
        BACKFILL_INTERVAL_SECS,
        force,
        || {
            let report = crate::plugins::calibration::backfill(store, cfg)?;
            Ok(format!(
                "scanned {}, back-filled {}",
                report.scanned, report.filled
            ))
        },
    )?);

    reports.push(run_guarded(
        store,
        "session_sweep",
        SWEEP_INTERVAL_SECS,
        force,
        || {
            let aborted = crate::plugins::dialectic::sweep_timeouts(store, cfg)?;
            Ok(format!("aborted {aborted} timed-out session(s)"))
        },
    )?);

    Ok(reports)
}
