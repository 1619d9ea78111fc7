//! Dialectic protocol: assignment, negotiation, idempotence, and timeouts.

use serde_json::json;
use std::collections::HashMap;
use tempfile::tempdir;
use vigil::core::auth;
use vigil::core::config::VigilConfig;
use vigil::core::db;
use vigil::core::error::VigilError;
use vigil::core::index;
use vigil::core::store::Store;
use vigil::plugins::dialectic::{self, Phase, SessionKind};
use vigil::plugins::govern::{self, Observation};

fn setup(dir: &std::path::Path) -> (Store, VigilConfig) {
    let store = Store::open(dir).unwrap();
    db::initialize_db(&store.root).unwrap();
    (store, VigilConfig::default())
}

/// Register agents with one calm governance cycle each, so they exist as
/// healthy reviewer candidates. Returns agent -> token.
fn register(store: &Store, cfg: &VigilConfig, agents: &[&str]) -> HashMap<String, String> {
    let mut tokens = HashMap::new();
    for agent in agents {
        let token = auth::issue_token(store, agent).unwrap();
        let obs = Observation {
            drift: Vec::new(),
            note: None,
        };
        govern::update(store, cfg, agent, &token, &obs, Some(0.2)).unwrap();
        tokens.insert(agent.to_string(), token);
    }
    tokens
}

#[test]
fn test_full_session_resolves_and_resumes_agent() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "looping on the same failing step",
        SessionKind::Recovery,
    )
    .unwrap();
    assert_eq!(session.phase, Phase::ReviewerAssigned);
    assert_eq!(session.reviewer_id.as_deref(), Some("hera"));
    assert!(!session.self_recovery);

    let ack = dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"account": "stuck retrying a failing migration", "proposed": {"max_complexity": 0.2}}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Thesis);

    let ack = dialectic::submit_antithesis(
        &store,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"observed": {"entropy": 0.4}, "concerns": ["retry count"]}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Antithesis);

    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"conditions": {"max_complexity": 0.2}}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Negotiation);
    assert_eq!(ack.session.rounds, 1);

    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"accept": true}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Resolved);
    assert_eq!(ack.session.status, "RESOLVED");
    assert!(ack.session.accepted_conditions.is_some());

    let entry = index::get(&store, "athena").unwrap().unwrap();
    assert_eq!(entry.status, "active");

    let (_, transcript) = dialectic::get_session(&store, &cfg, &session.id).unwrap();
    assert!(transcript.len() >= 4);
}

#[test]
fn test_duplicate_submission_is_acknowledged_without_advancing() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "retry storm",
        SessionKind::Recovery,
    )
    .unwrap();

    let payload = json!({"account": "identical resubmission"});
    let first = dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        payload.clone(),
    )
    .unwrap();
    assert!(!first.duplicate);

    let second =
        dialectic::submit_thesis(&store, &session.id, "athena", &tokens["athena"], payload)
            .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.session.phase, Phase::Thesis);

    let (_, transcript) = dialectic::get_session(&store, &cfg, &session.id).unwrap();
    let thesis_entries = transcript
        .iter()
        .filter(|e| e.phase == Phase::Thesis)
        .count();
    assert_eq!(thesis_entries, 1);
}

#[test]
fn test_identical_payload_in_later_phase_is_a_new_submission() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "proposal repeats the thesis",
        SessionKind::Recovery,
    )
    .unwrap();

    // The same JSON appears as the thesis and later as a negotiation
    // proposal. Idempotence is per phase: the proposal must register.
    let payload = json!({"conditions": {"max_complexity": 0.3}});
    dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        payload.clone(),
    )
    .unwrap();
    dialectic::submit_antithesis(
        &store,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"observed": {"entropy": 0.3}}),
    )
    .unwrap();

    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "athena",
        &tokens["athena"],
        payload,
    )
    .unwrap();
    assert!(!ack.duplicate);
    assert_eq!(ack.session.phase, Phase::Negotiation);
    assert_eq!(ack.session.rounds, 1);
}

#[test]
fn test_out_of_order_submissions_rejected() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "dispute over discovered interface",
        SessionKind::Recovery,
    )
    .unwrap();

    // Antithesis before thesis.
    let err = dialectic::submit_antithesis(
        &store,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"observed": {}}),
    )
    .unwrap_err();
    assert!(matches!(err, VigilError::ProtocolError(_)));

    // Thesis from the wrong party.
    let err = dialectic::submit_thesis(
        &store,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"account": "not my session"}),
    )
    .unwrap_err();
    assert!(matches!(err, VigilError::ProtocolError(_)));
}

#[test]
fn test_collusion_window_rotates_then_falls_back() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena", "hera", "zeus"]);

    let first = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "first pause",
        SessionKind::Recovery,
    )
    .unwrap();
    let first_reviewer = first.reviewer_id.clone().unwrap();
    assert_ne!(first_reviewer, "athena");

    // The next session for the same requester must rotate to the other peer.
    let second = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "second pause",
        SessionKind::Recovery,
    )
    .unwrap();
    let second_reviewer = second.reviewer_id.clone().unwrap();
    assert_ne!(second_reviewer, first_reviewer);
    assert_ne!(second_reviewer, "athena");

    // Both peers are now inside the window: no eligible reviewer remains.
    let third = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "third pause",
        SessionKind::Recovery,
    )
    .unwrap();
    assert!(third.self_recovery);
    assert!(third.reviewer_id.is_none());
    assert_eq!(third.phase, Phase::ReviewerAssigned);
}

#[test]
fn test_self_recovery_synthesizes_antithesis_and_resolves() {
    let dir = tempdir().unwrap();
    let (store, cfg) = setup(dir.path());
    let tokens = register(&store, &cfg, &["athena"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "alone in the workspace",
        SessionKind::Recovery,
    )
    .unwrap();
    assert!(session.self_recovery);

    let ack = dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"account": "spurious pause", "proposed": {"max_complexity": 0.1}}),
    )
    .unwrap();
    // The system supplies the antithesis immediately.
    assert_eq!(ack.session.phase, Phase::Antithesis);

    // The requester's own proposal is held to the stricter safety bar.
    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"conditions": {"max_complexity": 0.1}}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Resolved);
}

#[test]
fn test_negotiation_round_limit_aborts_session() {
    let dir = tempdir().unwrap();
    let (store, mut cfg) = setup(dir.path());
    cfg.max_negotiation_rounds = 2;
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "irreconcilable",
        SessionKind::Recovery,
    )
    .unwrap();
    dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"account": "it was fine"}),
    )
    .unwrap();
    dialectic::submit_antithesis(
        &store,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"concerns": ["it was not fine"]}),
    )
    .unwrap();

    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "hera",
        &tokens["hera"],
        json!({"conditions": {"max_complexity": 0.1}}),
    )
    .unwrap();
    assert_eq!(ack.session.rounds, 1);

    // A different counter-proposal burns the final round.
    let ack = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"conditions": {"max_complexity": 0.9}}),
    )
    .unwrap();
    assert_eq!(ack.session.phase, Phase::Aborted);
    assert_eq!(ack.session.status, "ABORTED");

    // Terminal sessions accept nothing further.
    let err = dialectic::submit_synthesis(
        &store,
        &cfg,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"accept": true}),
    )
    .unwrap_err();
    assert!(matches!(err, VigilError::ProtocolError(_)));
}

#[test]
fn test_inactivity_timeout_aborts_without_resuming() {
    let dir = tempdir().unwrap();
    let (store, mut cfg) = setup(dir.path());
    cfg.session_timeout_secs = 1;
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    let session = dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "abandoned session",
        SessionKind::Recovery,
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_secs(3));

    let (fetched, transcript) = dialectic::get_session(&store, &cfg, &session.id).unwrap();
    assert_eq!(fetched.phase, Phase::Aborted);
    assert!(transcript.iter().any(|e| e.phase == Phase::Aborted));

    // An aborted session never auto-resumes the agent.
    let err = dialectic::submit_thesis(
        &store,
        &session.id,
        "athena",
        &tokens["athena"],
        json!({"account": "too late"}),
    )
    .unwrap_err();
    assert!(matches!(err, VigilError::ProtocolError(_)));
}

#[test]
fn test_sweep_aborts_expired_sessions_in_bulk() {
    let dir = tempdir().unwrap();
    let (store, mut cfg) = setup(dir.path());
    cfg.session_timeout_secs = 1;
    let tokens = register(&store, &cfg, &["athena", "hera"]);

    dialectic::request_review(
        &store,
        &cfg,
        "athena",
        &tokens["athena"],
        "will expire",
        SessionKind::Recovery,
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_secs(3));

    let aborted = dialectic::sweep_timeouts(&store, &cfg).unwrap();
    assert_eq!(aborted, 1);
    assert_eq!(dialectic::sweep_timeouts(&store, &cfg).unwrap(), 0);
}
