//! Calibration tracking: confidence vs. eventual ground truth.
//!
//! Every decision contributes a sample bucketed by confidence decile. A
//! bounded background sweep back-fills ground truth for decisions old enough
//! to have an observable outcome, inferred from the agent's subsequent
//! trajectory. Resolved verification sessions contribute at reduced weight:
//! peer agreement corroborates, it is not ground truth. Calibration output is
//! used only to report quality and to trim the policy's adaptive sensitivity;
//! it never gates an individual decision.

use crate::core::broker::DbBroker;
use crate::core::config::VigilConfig;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

/// Weight of a reviewer-corroborated verification outcome.
pub const VERIFICATION_WEIGHT: f64 = 0.5;
/// Weight when the session fell back to self-recovery (lower trust).
pub const SELF_RECOVERY_WEIGHT: f64 = 0.25;

pub fn bucket_of(confidence: f64) -> i64 {
    ((confidence * 10.0).floor() as i64).clamp(0, 9)
}

/// Record the sample for a freshly appended decision, inside the caller's
/// transaction. `actual_correct` stays NULL until the backfill sweep.
pub fn record_decision_sample(
    conn: &Connection,
    decision_id: &str,
    confidence: f64,
    now: &str,
) -> Result<(), VigilError> {
    conn.execute(
        "INSERT INTO calibration_samples(id, decision_id, bucket, confidence, predicted_correct, weight, created_at)
         VALUES(?1, ?2, ?3, ?4, 1, 1.0, ?5)",
        params![
            time::new_event_id(),
            decision_id,
            bucket_of(confidence),
            confidence,
            now
        ],
    )?;
    Ok(())
}

/// Record a resolved verification session's outcome at reduced weight,
/// inside the caller's transaction.
pub fn record_session_sample(
    conn: &Connection,
    session_id: &str,
    confidence: f64,
    actual_correct: bool,
    self_recovery: bool,
    now: &str,
) -> Result<(), VigilError> {
    let weight = if self_recovery {
        SELF_RECOVERY_WEIGHT
    } else {
        VERIFICATION_WEIGHT
    };
    conn.execute(
        "INSERT INTO calibration_samples(id, session_id, bucket, confidence, predicted_correct, actual_correct, weight, created_at)
         VALUES(?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)",
        params![
            time::new_event_id(),
            session_id,
            bucket_of(confidence),
            confidence,
            actual_correct as i64,
            weight,
            now
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub filled: usize,
}

/// Back-fill ground truth for decisions old enough to have an observable
/// outcome. Bounded per run; idempotent on re-run (processed decisions carry
/// the `backfilled` mark and are never re-scanned).
pub fn backfill(store: &Store, cfg: &VigilConfig) -> Result<BackfillReport, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let cutoff = time::now_secs() - cfg.outcome_delay_secs;
    let batch = cfg.backfill_batch;

    broker.with_write(&db_path, "vigil", "calibration.backfill", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, verdict, ts FROM decisions
             WHERE backfilled = 0
             ORDER BY ts ASC
             LIMIT ?1",
        )?;
        let candidates: Vec<(String, String, String, String)> = stmt
            .query_map(params![batch], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut scanned = 0usize;
        let mut filled = 0usize;
        for (id, agent_id, verdict, ts) in candidates {
            if time::parse_epoch_z(&ts) > cutoff {
                // Too young to judge; stays unprocessed for a later sweep.
                continue;
            }
            scanned += 1;
            let correct = infer_outcome(conn, &agent_id, &verdict, &ts)?;
            conn.execute(
                "UPDATE decisions SET outcome = ?1, backfilled = 1 WHERE id = ?2",
                params![correct as i64, id],
            )?;
            conn.execute(
                "UPDATE calibration_samples SET actual_correct = ?1 WHERE decision_id = ?2",
                params![correct as i64, id],
            )?;
            filled += 1;
        }
        Ok(BackfillReport { scanned, filled })
    })
}

/// Ground truth heuristic from the agent's subsequent trajectory:
/// - a blocking verdict was correct when the agent did go on to request
///   recovery (it really was stuck);
/// - a permissive verdict was correct when no later halt followed it.
fn infer_outcome(
    conn: &Connection,
    agent_id: &str,
    verdict: &str,
    ts: &str,
) -> Result<bool, VigilError> {
    let blocking = verdict == "pause-for-review" || verdict == "halt";
    if blocking {
        let recovery_after: Option<String> = conn
            .query_row(
                "SELECT id FROM sessions WHERE agent_id = ?1 AND created_at >= ?2 LIMIT 1",
                params![agent_id, ts],
                |row| row.get(0),
            )
            .optional()?;
        Ok(recovery_after.is_some())
    } else {
        let halt_after: Option<String> = conn
            .query_row(
                "SELECT id FROM decisions WHERE agent_id = ?1 AND ts > ?2 AND verdict = 'halt' LIMIT 1",
                params![agent_id, ts],
                |row| row.get(0),
            )
            .optional()?;
        Ok(halt_after.is_none())
    }
}

/// Signed calibration gap over all resolved samples, positive when the
/// policy has been overconfident. Cheap enough to read once per cycle; feeds
/// only the sensitivity trim, never an individual verdict.
pub fn overconfidence(conn: &Connection) -> Result<f64, VigilError> {
    let gap: Option<f64> = conn.query_row(
        "SELECT SUM(confidence * weight) / SUM(weight) - SUM(actual_correct * weight) / SUM(weight)
         FROM calibration_samples WHERE actual_correct IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(gap.unwrap_or(0.0))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStat {
    pub bucket: i64,
    pub weight: f64,
    pub mean_confidence: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub buckets: Vec<BucketStat>,
    /// Expected calibration error: weighted mean |confidence - accuracy|.
    pub ece: f64,
    /// Signed gap, positive when overconfident.
    pub overconfidence: f64,
}

/// Aggregate resolved samples into the per-bucket calibration table.
pub fn report(store: &Store) -> Result<CalibrationReport, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    broker.with_read(&db_path, |conn| {
        let mut stmt = conn.prepare(
            "SELECT bucket,
                    SUM(weight),
                    SUM(confidence * weight) / SUM(weight),
                    SUM(actual_correct * weight) / SUM(weight)
             FROM calibration_samples
             WHERE actual_correct IS NOT NULL
             GROUP BY bucket
             ORDER BY bucket",
        )?;
        let buckets: Vec<BucketStat> = stmt
            .query_map([], |row| {
                Ok(BucketStat {
                    bucket: row.get(0)?,
                    weight: row.get(1)?,
                    mean_confidence: row.get(2)?,
                    accuracy: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let total: f64 = buckets.iter().map(|b| b.weight).sum();
        let (ece, over) = if total > 0.0 {
            let ece = buckets
                .iter()
                .map(|b| b.weight * (b.mean_confidence - b.accuracy).abs())
                .sum::<f64>()
                / total;
            let over = buckets
                .iter()
                .map(|b| b.weight * (b.mean_confidence - b.accuracy))
                .sum::<f64>()
                / total;
            (ece, over)
        } else {
            (0.0, 0.0)
        };
        Ok(CalibrationReport {
            buckets,
            ece,
            overconfidence: over,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_of_deciles() {
        assert_eq!(bucket_of(0.0), 0);
        assert_eq!(bucket_of(0.55), 5);
        assert_eq!(bucket_of(0.99), 9);
        assert_eq!(bucket_of(1.0), 9);
    }
}
