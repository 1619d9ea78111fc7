//! Write leases with heartbeat and TTL.
//!
//! A lease is the one-writer-per-resource guarantee. Acquisition blocks up to
//! a bounded wait; failure within the wait returns a retryable `BusyError`,
//! never an indefinite block. A lease whose heartbeat is older than its TTL
//! is stale and is reclaimed by the next acquirer, so a crashed holder cannot
//! wedge its resource.
//!
//! Holders are unique per-call identities, not stable actor names: holder
//! equality exists so the owning call can renew and release, and must never
//! let a second concurrent caller through.
//!
//! Agent records are guarded by `agent/<id>` leases; background jobs guard
//! their own re-entrancy with `job/<name>` leases.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{OptionalExtension, params};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval while waiting on a contended lease.
const ACQUIRE_POLL_MS: u64 = 25;

/// An acquired lease. Release explicitly; a dropped-but-unreleased lease is
/// reclaimed by TTL expiry.
#[derive(Debug)]
pub struct Lease {
    pub resource: String,
    pub holder: String,
    pub ttl_seconds: i64,
    root: PathBuf,
}

impl Lease {
    /// Acquire a lease on `resource`, waiting up to `wait` for a current
    /// holder to release or go stale.
    pub fn acquire(
        store: &Store,
        resource: &str,
        holder: &str,
        ttl_seconds: i64,
        wait: Duration,
    ) -> Result<Lease, VigilError> {
        let deadline = Instant::now() + wait;
        loop {
            match try_acquire(store, resource, holder, ttl_seconds)? {
                Some(lease) => return Ok(lease),
                None => {
                    if Instant::now() >= deadline {
                        return Err(VigilError::BusyError(format!(
                            "lease on '{}' held by another writer; retry with backoff",
                            resource
                        )));
                    }
                    thread::sleep(Duration::from_millis(ACQUIRE_POLL_MS));
                }
            }
        }
    }

    /// Refresh the heartbeat. Fails with `ProtocolError` if the lease was
    /// reclaimed out from under us.
    pub fn renew(&self) -> Result<(), VigilError> {
        let broker = DbBroker::new(&self.root);
        let db_path = db::vigil_db_path(&self.root);
        let resource = self.resource.clone();
        let holder = self.holder.clone();
        broker.with_write(&db_path, &holder, "lease.renew", |conn| {
            let changed = conn.execute(
                "UPDATE leases SET heartbeat = ?1 WHERE resource = ?2 AND holder = ?3",
                params![time::now_secs(), resource, holder],
            )?;
            if changed == 0 {
                return Err(VigilError::ProtocolError(format!(
                    "lease on '{}' no longer held by '{}'",
                    resource, holder
                )));
            }
            Ok(())
        })
    }

    /// Release the lease. Releasing a lease already reclaimed is a no-op.
    pub fn release(self) -> Result<(), VigilError> {
        let broker = DbBroker::new(&self.root);
        let db_path = db::vigil_db_path(&self.root);
        broker.with_write(&db_path, &self.holder, "lease.release", |conn| {
            conn.execute(
                "DELETE FROM leases WHERE resource = ?1 AND holder = ?2",
                params![self.resource, self.holder],
            )?;
            Ok(())
        })
    }
}

/// Single non-blocking acquisition attempt. Returns `None` when the resource
/// is held by a live holder.
fn try_acquire(
    store: &Store,
    resource: &str,
    holder: &str,
    ttl_seconds: i64,
) -> Result<Option<Lease>, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let now = time::now_secs();

    let acquired = broker.with_write(&db_path, holder, "lease.acquire", |conn| {
        let existing: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT holder, heartbeat, ttl_seconds FROM leases WHERE resource = ?1",
                params![resource],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO leases(resource, holder, heartbeat, ttl_seconds) VALUES(?1, ?2, ?3, ?4)",
                    params![resource, holder, now, ttl_seconds],
                )?;
                Ok(true)
            }
            Some((current_holder, heartbeat, ttl)) => {
                let stale = now > heartbeat + ttl;
                if current_holder == holder || stale {
                    conn.execute(
                        "UPDATE leases SET holder = ?1, heartbeat = ?2, ttl_seconds = ?3 WHERE resource = ?4",
                        params![holder, now, ttl_seconds, resource],
                    )?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    })?;

    if acquired {
        Ok(Some(Lease {
            resource: resource.to_string(),
            holder: holder.to_string(),
            ttl_seconds,
            root: store.root.clone(),
        }))
    } else {
        Ok(None)
    }
}

/// Delete every lease whose heartbeat has outlived its TTL. Returns the count
/// reclaimed. Used by the background reaper; ordinary acquisition also
/// reclaims opportunistically.
pub fn reap_stale(store: &Store) -> Result<usize, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let now = time::now_secs();
    broker.with_write(&db_path, "vigil", "lease.reap", |conn| {
        let reclaimed = conn.execute(
            "DELETE FROM leases WHERE ?1 > heartbeat + ttl_seconds",
            params![now],
        )?;
        Ok(reclaimed)
    })
}
