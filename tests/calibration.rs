//! Calibration backfill idempotence and report aggregation.

use tempfile::tempdir;
use vigil::core::auth;
use vigil::core::broker::DbBroker;
use vigil::core::config::VigilConfig;
use vigil::core::db;
use vigil::core::store::Store;
use vigil::plugins::calibration;
use vigil::plugins::govern::{self, Observation};

fn setup(dir: &std::path::Path) -> (Store, VigilConfig) {
    let store = Store::open(dir).unwrap();
    db::initialize_db(&store.root).unwrap();
    (store, VigilConfig::default())
}

fn run_cycles(store: &Store, cfg: &VigilConfig, agent: &str, n: usize) {
    let token = auth::issue_token(store, agent).unwrap();
    for _ in 0..n {
        let obs = Observation {
            drift: Vec::new(),
            note: None,
        };
        govern::update(store, cfg, agent, &token, &obs, Some(0.3)).unwrap();
    }
}

#[test]
fn test_backfill_is_idempotent() {
    let dir = tempdir().unwrap();
    let (store, mut cfg) = setup(dir.path());
    // Outcomes are observable immediately.
    cfg.outcome_delay_secs = 0;
    run_cycles(&store, &cfg, "athena", 3);

    let first = calibration::backfill(&store, &cfg).unwrap();
    assert_eq!(first.filled, 3);

    let report_after_first = calibration::report(&store).unwrap();
    let total_weight: f64 = report_after_first.buckets.iter().map(|b| b.weight).sum();
    assert!((total_weight - 3.0).abs() < 1e-9);

    // Re-running scans nothing new and changes no totals.
    let second = calibration::backfill(&store, &cfg).unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.filled, 0);
    let report_after_second = calibration::report(&store).unwrap();
    let total_after: f64 = report_after_second.buckets.iter().map(|b| b.weight).sum();
    assert!((total_after - total_weight).abs() < 1e-9);
    assert!((report_after_second.ece - report_after_first.ece).abs() < 1e-9);
}

#[test]
fn test_young_decisions_wait_for_outcome_window() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    run_cycles(&store, &cfg, "athena", 2);

    // Default delay is 900s; nothing qualifies yet.
    let report = calibration::backfill(&store, &cfg).unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.filled, 0);
}

#[test]
fn test_permissive_verdicts_with_calm_future_score_correct() {
    let dir = tempdir().unwrap();
    let (store, mut cfg) = setup(dir.path());
    cfg.outcome_delay_secs = 0;
    run_cycles(&store, &cfg, "athena", 4);

    calibration::backfill(&store, &cfg).unwrap();
    let report = calibration::report(&store).unwrap();
    assert!(!report.buckets.is_empty());
    // Calm proceed decisions with no later halt are all judged correct.
    for bucket in &report.buckets {
        assert!((bucket.accuracy - 1.0).abs() < 1e-9);
    }
    assert!(report.overconfidence <= 0.0);
}

#[test]
fn test_empty_report_is_zeroed() {
    let dir = tempdir().unwrap();
    let (store, _cfg) = setup(dir.path());
    let report = calibration::report(&store).unwrap();
    assert!(report.buckets.is_empty());
    assert_eq!(report.ece, 0.0);
    assert_eq!(report.overconfidence, 0.0);
}

#[test]
fn test_verification_sessions_carry_reduced_weight() {
    let dir = tempdir().unwrap();
    let (store, _cfg) = setup(dir.path());
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);

    broker
        .with_write(&db_path, "test", "seed", |conn| {
            calibration::record_session_sample(conn, "sess-1", 0.75, true, false, "100Z")?;
            calibration::record_session_sample(conn, "sess-2", 0.75, true, true, "101Z")?;
            Ok(())
        })
        .unwrap();

    let report = calibration::report(&store).unwrap();
    let total_weight: f64 = report.buckets.iter().map(|b| b.weight).sum();
    assert!(
        (total_weight - (calibration::VERIFICATION_WEIGHT + calibration::SELF_RECOVERY_WEIGHT))
            .abs()
            < 1e-9
    );
}

#[test]
fn test_overconfidence_signal_from_wrong_confident_calls() {
    let dir = tempdir().unwrap();
    let (store, _cfg) = setup(dir.path());
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);

    broker
        .with_write(&db_path, "test", "seed", |conn| {
            calibration::record_decision_sample(conn, "dec-1", 0.9, "100Z")?;
            conn.execute(
                "UPDATE calibration_samples SET actual_correct = 0 WHERE decision_id = 'dec-1'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

    let gap = broker
        .with_read(&db_path, |conn| calibration::overconfidence(conn))
        .unwrap();
    assert!((gap - 0.9).abs() < 1e-9);
}
