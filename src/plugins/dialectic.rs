//! Dialectic coordinator: peer-reviewed recovery for paused agents.
//!
//! A paused (or loop-stuck, or discovery-disputing) agent opens a session,
//! an independent reviewer is assigned, and the two negotiate resumption
//! conditions through a bounded state machine:
//!
//! ```text
//! REQUESTED -> REVIEWER_ASSIGNED -> THESIS -> ANTITHESIS
//!     -> NEGOTIATION(0..max_rounds) -> RESOLVED | ABORTED
//! ```
//!
//! The phase index only ever advances. A session never holds the paused
//! agent's own lease for its (human-timescale) lifetime; each phase
//! transition briefly takes a `session/<id>` lease instead, so ongoing
//! negotiation never blocks the agent's other traffic. Duplicate identical
//! submissions are acknowledged without advancing the phase or counting a
//! round. Inactivity past the configured window aborts the session; an
//! aborted session never auto-resumes the agent.

use crate::core::auth;
use crate::core::broker::DbBroker;
use crate::core::config::VigilConfig;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::index;
use crate::core::lease::Lease;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::agents;
use crate::plugins::calibration;
use crate::plugins::dynamics::{AgentState, AgentStatus, StateVector};
use crate::plugins::policy;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

/// Actor name for system-synthesized transcript entries.
const SYSTEM_PARTY: &str = "vigil";
/// Confidence attributed to a resolved verification session's sample.
const VERIFICATION_CONFIDENCE: f64 = 0.75;
/// Session lease TTL; transitions are short.
const SESSION_LEASE_TTL: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    Requested,
    ReviewerAssigned,
    Thesis,
    Antithesis,
    Negotiation,
    Resolved,
    Aborted,
}

impl Phase {
    pub fn index(self) -> i64 {
        match self {
            Phase::Requested => 0,
            Phase::ReviewerAssigned => 1,
            Phase::Thesis => 2,
            Phase::Antithesis => 3,
            Phase::Negotiation => 4,
            Phase::Resolved => 5,
            Phase::Aborted => 6,
        }
    }

    pub fn from_index(i: i64) -> Phase {
        match i {
            0 => Phase::Requested,
            1 => Phase::ReviewerAssigned,
            2 => Phase::Thesis,
            3 => Phase::Antithesis,
            4 => Phase::Negotiation,
            5 => Phase::Resolved,
            _ => Phase::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Resolved | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Requested => "REQUESTED",
            Phase::ReviewerAssigned => "REVIEWER_ASSIGNED",
            Phase::Thesis => "THESIS",
            Phase::Antithesis => "ANTITHESIS",
            Phase::Negotiation => "NEGOTIATION",
            Phase::Resolved => "RESOLVED",
            Phase::Aborted => "ABORTED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Recovery,
    Verification,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Recovery => "recovery",
            SessionKind::Verification => "verification",
        }
    }

    pub fn parse(s: &str) -> SessionKind {
        match s {
            "verification" => SessionKind::Verification,
            _ => SessionKind::Recovery,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialecticSession {
    pub id: String,
    pub agent_id: String,
    pub reviewer_id: Option<String>,
    pub kind: SessionKind,
    pub phase: Phase,
    pub rounds: i64,
    pub status: String,
    pub reason: String,
    pub proposed_conditions: Option<JsonValue>,
    pub proposed_by: Option<String>,
    pub accepted_conditions: Option<JsonValue>,
    pub self_recovery: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub event_id: String,
    pub party: String,
    pub phase: Phase,
    pub payload: JsonValue,
    pub payload_hash: String,
    pub ts: String,
}

/// Outcome of a submission: either the phase advanced (possibly to a
/// terminal), or an identical duplicate was acknowledged without effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionAck {
    pub session: DialecticSession,
    pub duplicate: bool,
}

fn payload_hash(payload: &JsonValue) -> String {
    let canonical = payload.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn load_session(conn: &Connection, session_id: &str) -> Result<DialecticSession, VigilError> {
    let row: Option<DialecticSession> = conn
        .query_row(
            "SELECT id, agent_id, reviewer_id, kind, phase, rounds, status, reason,
                    proposed_conditions, proposed_by, accepted_conditions, self_recovery,
                    created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                let kind: String = row.get(3)?;
                let phase: i64 = row.get(4)?;
                let proposed: Option<String> = row.get(8)?;
                let accepted: Option<String> = row.get(10)?;
                let self_recovery: i64 = row.get(11)?;
                Ok(DialecticSession {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    reviewer_id: row.get(2)?,
                    kind: SessionKind::parse(&kind),
                    phase: Phase::from_index(phase),
                    rounds: row.get(5)?,
                    status: row.get(6)?,
                    reason: row.get(7)?,
                    proposed_conditions: proposed.and_then(|s| serde_json::from_str(&s).ok()),
                    proposed_by: row.get(9)?,
                    accepted_conditions: accepted.and_then(|s| serde_json::from_str(&s).ok()),
                    self_recovery: self_recovery != 0,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                })
            },
        )
        .optional()?;
    row.ok_or_else(|| VigilError::NotFound(format!("session '{}'", session_id)))
}

fn load_transcript(
    conn: &Connection,
    session_id: &str,
) -> Result<Vec<TranscriptEntry>, VigilError> {
    let mut stmt = conn.prepare(
        "SELECT event_id, party, phase, payload, payload_hash, ts
         FROM session_transcript WHERE session_id = ?1 ORDER BY ts, event_id",
    )?;
    let iter = stmt.query_map(params![session_id], |row| {
        let phase: i64 = row.get(2)?;
        let payload: String = row.get(3)?;
        Ok(TranscriptEntry {
            event_id: row.get(0)?,
            party: row.get(1)?,
            phase: Phase::from_index(phase),
            payload: serde_json::from_str(&payload).unwrap_or(JsonValue::Null),
            payload_hash: row.get(4)?,
            ts: row.get(5)?,
        })
    })?;
    iter.collect::<Result<Vec<_>, _>>()
        .map_err(VigilError::RusqliteError)
}

fn insert_transcript(
    conn: &Connection,
    session_id: &str,
    party: &str,
    phase: Phase,
    payload: &JsonValue,
    now: &str,
) -> Result<(), VigilError> {
    conn.execute(
        "INSERT INTO session_transcript(event_id, session_id, party, phase, payload, payload_hash, ts)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            time::new_event_id(),
            session_id,
            party,
            phase.index(),
            payload.to_string(),
            payload_hash(payload),
            now
        ],
    )?;
    Ok(())
}

// Scoped to the phase being submitted: a negotiation proposal that happens
// to equal an earlier thesis is a new submission, not a retry.
fn duplicate_submission(
    conn: &Connection,
    session_id: &str,
    party: &str,
    phase: Phase,
    payload: &JsonValue,
) -> Result<bool, VigilError> {
    let hash = payload_hash(payload);
    let existing: Option<String> = conn
        .query_row(
            "SELECT event_id FROM session_transcript
             WHERE session_id = ?1 AND party = ?2 AND phase = ?3 AND payload_hash = ?4 LIMIT 1",
            params![session_id, party, phase.index(), hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(existing.is_some())
}

fn advance_phase(
    conn: &Connection,
    session: &DialecticSession,
    to: Phase,
    now: &str,
) -> Result<(), VigilError> {
    // Monotone by construction: refuse to write a smaller index.
    if to.index() < session.phase.index() {
        return Err(VigilError::ProtocolError(format!(
            "phase may not regress from {} to {}",
            session.phase, to
        )));
    }
    let status = match to {
        Phase::Resolved => "RESOLVED",
        Phase::Aborted => "ABORTED",
        _ => "ACTIVE",
    };
    conn.execute(
        "UPDATE sessions SET phase = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
        params![to.index(), status, now, session.id],
    )?;
    Ok(())
}

fn with_session_lease<F, R>(store: &Store, session_id: &str, party: &str, f: F) -> Result<R, VigilError>
where
    F: FnOnce() -> Result<R, VigilError>,
{
    // Per-call holder identity; two submissions from the same party must
    // still serialize against each other.
    let holder = format!("{party}:{}", time::new_event_id());
    let lease = Lease::acquire(
        store,
        &format!("session/{session_id}"),
        &holder,
        SESSION_LEASE_TTL,
        Duration::from_millis(1_000),
    )?;
    let result = f();
    lease.release()?;
    result
}

/// Open a review session for a paused, loop-stuck, or disputing agent, then
/// assign a reviewer (or fall back to self-recovery when nobody is eligible).
pub fn request_review(
    store: &Store,
    cfg: &VigilConfig,
    agent_id: &str,
    token: &str,
    reason: &str,
    kind: SessionKind,
) -> Result<DialecticSession, VigilError> {
    auth::verify_token(store, agent_id, token)?;
    if reason.trim().is_empty() {
        return Err(VigilError::ValidationError(
            "a review request needs a reason".to_string(),
        ));
    }

    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_id = time::new_event_id();
    let now = time::now_epoch_z();

    let agent = agent_id.to_string();
    let reason_owned = reason.to_string();
    broker.with_write(&db_path, &agent, "dialectic.request", |conn| {
        let (state, _warnings) = agents::load_state(conn, &agent)?
            .ok_or_else(|| VigilError::NotFound(format!("agent '{}'", agent)))?;
        if state.status == AgentStatus::Archived {
            return Err(VigilError::ProtocolError(format!(
                "agent '{}' is archived and cannot request review",
                agent
            )));
        }
        conn.execute(
            "INSERT INTO sessions(id, agent_id, kind, phase, reason, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                session_id,
                agent,
                kind.as_str(),
                Phase::Requested.index(),
                reason_owned,
                now
            ],
        )?;
        let request_payload = serde_json::json!({ "reason": reason_owned });
        insert_transcript(conn, &session_id, &agent, Phase::Requested, &request_payload, &now)?;
        Ok(())
    })?;

    assign_reviewer(store, cfg, &session_id)
}

/// Select a healthy, uninvolved reviewer: never the requester, never a
/// reviewer of this requester within the last K sessions, preferring
/// low-load/high-coherence candidates. No eligible candidate means the
/// session continues in lower-trust self-recovery mode.
fn assign_reviewer(
    store: &Store,
    cfg: &VigilConfig,
    session_id: &str,
) -> Result<DialecticSession, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    let k = cfg.collusion_window_k;

    with_session_lease(store, session_id, SYSTEM_PARTY, || {
        broker.with_write(&db_path, SYSTEM_PARTY, "dialectic.assign", |conn| {
            let session = load_session(conn, &session_owned)?;
            if session.phase != Phase::Requested {
                // Already assigned; idempotent.
                return Ok(session);
            }
            let now = time::now_epoch_z();

            let mut recent_stmt = conn.prepare(
                "SELECT reviewer_id FROM reviewer_history
                 WHERE agent_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            let recent: Vec<String> = recent_stmt
                .query_map(params![session.agent_id, k], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;

            let candidates = reviewer_candidates(conn, &session, &recent)?;
            let best = candidates.into_iter().max_by(|a, b| {
                a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
            });

            match best {
                Some((reviewer_id, _score)) => {
                    conn.execute(
                        "UPDATE sessions SET reviewer_id = ?1, phase = ?2, updated_at = ?3 WHERE id = ?4",
                        params![
                            reviewer_id,
                            Phase::ReviewerAssigned.index(),
                            now,
                            session.id
                        ],
                    )?;
                    conn.execute(
                        "INSERT INTO reviewer_history(session_id, agent_id, reviewer_id, ts)
                         VALUES(?1, ?2, ?3, ?4)",
                        params![session.id, session.agent_id, reviewer_id, now],
                    )?;
                }
                None => {
                    conn.execute(
                        "UPDATE sessions SET self_recovery = 1, phase = ?1, updated_at = ?2 WHERE id = ?3",
                        params![Phase::ReviewerAssigned.index(), now, session.id],
                    )?;
                }
            }
            load_session(conn, &session_owned)
        })
    })
}

/// Score eligible reviewer candidates: coherence minus current review load.
fn reviewer_candidates(
    conn: &Connection,
    session: &DialecticSession,
    recent_reviewers: &[String],
) -> Result<Vec<(String, f64)>, VigilError> {
    let mut stmt = conn.prepare(
        "SELECT agent_id, coherence FROM agent_states WHERE status = 'active' AND agent_id != ?1",
    )?;
    let rows: Vec<(String, f64)> = stmt
        .query_map(params![session.agent_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut scored = Vec::new();
    for (candidate, coherence) in rows {
        if recent_reviewers.contains(&candidate) {
            continue;
        }
        let load: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE reviewer_id = ?1 AND status = 'ACTIVE'",
            params![candidate],
            |row| row.get(0),
        )?;
        scored.push((candidate, coherence - 0.2 * load as f64));
    }
    Ok(scored)
}

/// Requester states what happened and proposes resumption conditions.
/// In self-recovery mode the system immediately synthesizes an antithesis
/// from the requester's own metrics.
pub fn submit_thesis(
    store: &Store,
    session_id: &str,
    agent_id: &str,
    token: &str,
    payload: JsonValue,
) -> Result<SubmissionAck, VigilError> {
    auth::verify_token(store, agent_id, token)?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    let party = agent_id.to_string();

    with_session_lease(store, session_id, agent_id, || {
        broker.with_write(&db_path, &party, "dialectic.thesis", |conn| {
            let session = load_session(conn, &session_owned)?;
            ensure_active(&session)?;
            if session.agent_id != party {
                return Err(VigilError::ProtocolError(format!(
                    "only the requester '{}' may submit the thesis",
                    session.agent_id
                )));
            }
            if duplicate_submission(conn, &session.id, &party, Phase::Thesis, &payload)? {
                return Ok(SubmissionAck { session, duplicate: true });
            }
            if session.phase != Phase::ReviewerAssigned {
                return Err(VigilError::ProtocolError(format!(
                    "thesis not accepted in phase {}",
                    session.phase
                )));
            }

            let now = time::now_epoch_z();
            insert_transcript(conn, &session.id, &party, Phase::Thesis, &payload, &now)?;
            advance_phase(conn, &session, Phase::Thesis, &now)?;

            if session.self_recovery {
                let (state, _warnings) = agents::load_state(conn, &session.agent_id)?
                    .ok_or_else(|| VigilError::NotFound(format!("agent '{}'", session.agent_id)))?;
                let antithesis = synthesize_antithesis(&state);
                insert_transcript(
                    conn,
                    &session.id,
                    SYSTEM_PARTY,
                    Phase::Antithesis,
                    &antithesis,
                    &now,
                )?;
                let session = load_session(conn, &session_owned)?;
                advance_phase(conn, &session, Phase::Antithesis, &now)?;
            }

            let session = load_session(conn, &session_owned)?;
            Ok(SubmissionAck { session, duplicate: false })
        })
    })
}

/// A plausible antithesis from the requester's own metrics, used when no
/// independent reviewer is available.
fn synthesize_antithesis(state: &AgentState) -> JsonValue {
    let mut concerns = Vec::new();
    if state.entropy > 0.9 {
        concerns.push(format!("entropy {:.2} remains elevated", state.entropy));
    }
    if state.coherence < 0.4 {
        concerns.push(format!("coherence {:.2} is depressed", state.coherence));
    }
    if state.void_.abs() > policy::VOID_EVENT_THRESHOLD {
        concerns.push(format!("void magnitude {:.2} indicates imbalance", state.void_));
    }
    if concerns.is_empty() {
        concerns.push("metrics are nominal; pause may have been conservative".to_string());
    }
    serde_json::json!({
        "observed": {
            "energy": state.energy,
            "integrity": state.integrity,
            "entropy": state.entropy,
            "void": state.void_,
            "coherence": state.coherence,
        },
        "concerns": concerns,
        "self_recovery": true,
    })
}

/// Reviewer independently states observed metrics and concerns.
pub fn submit_antithesis(
    store: &Store,
    session_id: &str,
    reviewer_id: &str,
    token: &str,
    payload: JsonValue,
) -> Result<SubmissionAck, VigilError> {
    auth::verify_token(store, reviewer_id, token)?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    let party = reviewer_id.to_string();

    with_session_lease(store, session_id, reviewer_id, || {
        broker.with_write(&db_path, &party, "dialectic.antithesis", |conn| {
            let session = load_session(conn, &session_owned)?;
            ensure_active(&session)?;
            if session.reviewer_id.as_deref() != Some(party.as_str()) {
                return Err(VigilError::ProtocolError(format!(
                    "only the assigned reviewer may submit the antithesis to session '{}'",
                    session.id
                )));
            }
            if duplicate_submission(conn, &session.id, &party, Phase::Antithesis, &payload)? {
                return Ok(SubmissionAck { session, duplicate: true });
            }
            if session.phase != Phase::Thesis {
                return Err(VigilError::ProtocolError(format!(
                    "antithesis not accepted in phase {}",
                    session.phase
                )));
            }
            let now = time::now_epoch_z();
            insert_transcript(conn, &session.id, &party, Phase::Antithesis, &payload, &now)?;
            advance_phase(conn, &session, Phase::Antithesis, &now)?;
            let session = load_session(conn, &session_owned)?;
            Ok(SubmissionAck { session, duplicate: false })
        })
    })
}

/// Either party proposes a synthesis: resumption conditions both can live
/// with. Accepted when both explicitly agree or the proposals are identical
/// (automatically mergeable); bounded by the round limit, after which the
/// session aborts.
pub fn submit_synthesis(
    store: &Store,
    cfg: &VigilConfig,
    session_id: &str,
    party_id: &str,
    token: &str,
    payload: JsonValue,
) -> Result<SubmissionAck, VigilError> {
    auth::verify_token(store, party_id, token)?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    let party = party_id.to_string();
    let max_rounds = cfg.max_negotiation_rounds;

    with_session_lease(store, session_id, party_id, || {
        broker.with_write(&db_path, &party, "dialectic.synthesis", |conn| {
            let session = load_session(conn, &session_owned)?;
            ensure_active(&session)?;
            let is_requester = session.agent_id == party;
            let is_reviewer = session.reviewer_id.as_deref() == Some(party.as_str());
            if !is_requester && !is_reviewer {
                return Err(VigilError::ProtocolError(format!(
                    "'{}' is not a party to session '{}'",
                    party, session.id
                )));
            }
            if session.phase < Phase::Antithesis {
                return Err(VigilError::ProtocolError(format!(
                    "synthesis not accepted in phase {}",
                    session.phase
                )));
            }
            if duplicate_submission(conn, &session.id, &party, Phase::Negotiation, &payload)? {
                return Ok(SubmissionAck { session, duplicate: true });
            }

            let now = time::now_epoch_z();
            insert_transcript(conn, &session.id, &party, Phase::Negotiation, &payload, &now)?;

            let accept = payload.get("accept").and_then(|v| v.as_bool()).unwrap_or(false);
            let conditions = payload.get("conditions").cloned();

            let agreed: Option<JsonValue> = match (&conditions, accept) {
                // Explicit acceptance of the standing proposal from the other party.
                (None, true) => match (&session.proposed_conditions, &session.proposed_by) {
                    (Some(prop), Some(by)) if *by != party => Some(prop.clone()),
                    _ => {
                        return Err(VigilError::ProtocolError(
                            "nothing from the other party to accept".to_string(),
                        ));
                    }
                },
                (None, false) => {
                    return Err(VigilError::ValidationError(
                        "synthesis needs 'conditions' or 'accept': true".to_string(),
                    ));
                }
                // With no reviewer, the requester's own proposal goes straight
                // to the (stricter) safety check.
                (Some(c), _) if session.self_recovery && is_requester => Some(c.clone()),
                (Some(c), _) => {
                    // Identical counter-proposal from the other party merges automatically.
                    match (&session.proposed_conditions, &session.proposed_by) {
                        (Some(prop), Some(by)) if *by != party && prop == c => Some(c.clone()),
                        _ => None,
                    }
                }
            };

            if let Some(conditions) = agreed {
                if safety_check(conn, &session, &conditions, cfg)? {
                    return resolve(conn, &session, &conditions, &now);
                }
                insert_transcript(
                    conn,
                    &session.id,
                    SYSTEM_PARTY,
                    Phase::Negotiation,
                    &serde_json::json!({
                        "rejected": "accepted conditions failed policy safety checks",
                        "conditions": conditions,
                    }),
                    &now,
                )?;
            }

            // A proposal (or a failed acceptance) consumes a round.
            let rounds = session.rounds + 1;
            if rounds >= max_rounds {
                advance_phase(conn, &session, Phase::Aborted, &now)?;
                conn.execute(
                    "UPDATE sessions SET rounds = ?1 WHERE id = ?2",
                    params![rounds, session.id],
                )?;
                let session = load_session(conn, &session_owned)?;
                return Ok(SubmissionAck { session, duplicate: false });
            }

            conn.execute(
                "UPDATE sessions SET rounds = ?1, proposed_conditions = ?2, proposed_by = ?3,
                        phase = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    rounds,
                    conditions.as_ref().map(|c| c.to_string()),
                    conditions.as_ref().map(|_| party.clone()),
                    Phase::Negotiation.index().max(session.phase.index()),
                    now,
                    session.id
                ],
            )?;
            let session = load_session(conn, &session_owned)?;
            Ok(SubmissionAck { session, duplicate: false })
        })
    })
}

/// Resolution safety: the agreed conditions must re-pass the decision policy
/// against the requester's current state. Self-recovery sessions are held to
/// the stricter bar of an unqualified proceed.
fn safety_check(
    conn: &Connection,
    session: &DialecticSession,
    conditions: &JsonValue,
    cfg: &VigilConfig,
) -> Result<bool, VigilError> {
    let (state, _) = agents::load_state(conn, &session.agent_id)?
        .ok_or_else(|| VigilError::NotFound(format!("agent '{}'", session.agent_id)))?;
    let complexity_cap = conditions
        .get("max_complexity")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.5);
    if !(0.0..=1.0).contains(&complexity_cap) || !complexity_cap.is_finite() {
        return Ok(false);
    }
    let vector = StateVector {
        energy: state.energy,
        integrity: state.integrity,
        entropy: state.entropy,
        void_: state.void_,
        coherence: state.coherence,
    };
    let decision = policy::decide(&vector, &state.history, complexity_cap, cfg.blend_ratio);
    let ok = if session.self_recovery {
        decision.verdict == policy::Verdict::Proceed
    } else {
        !decision.verdict.is_blocking()
    };
    Ok(ok)
}

fn resolve(
    conn: &Connection,
    session: &DialecticSession,
    conditions: &JsonValue,
    now: &str,
) -> Result<SubmissionAck, VigilError> {
    advance_phase(conn, session, Phase::Resolved, now)?;
    conn.execute(
        "UPDATE sessions SET accepted_conditions = ?1 WHERE id = ?2",
        params![conditions.to_string(), session.id],
    )?;
    agents::set_status(conn, &session.agent_id, AgentStatus::Active, now)?;
    index::set_status(conn, &session.agent_id, "active")?;

    if session.kind == SessionKind::Verification {
        // Peer agreement corroborates the claim; reduced weight, not ground truth.
        calibration::record_session_sample(
            conn,
            &session.id,
            VERIFICATION_CONFIDENCE,
            true,
            session.self_recovery,
            now,
        )?;
    }

    let session = load_session(conn, &session.id)?;
    Ok(SubmissionAck { session, duplicate: false })
}

fn ensure_active(session: &DialecticSession) -> Result<(), VigilError> {
    if session.phase.is_terminal() {
        return Err(VigilError::ProtocolError(format!(
            "session '{}' is terminal ({})",
            session.id, session.phase
        )));
    }
    Ok(())
}

/// Fetch a session and its transcript. Applies the inactivity timeout lazily,
/// so an expired session reports ABORTED to both parties on the next query.
pub fn get_session(
    store: &Store,
    cfg: &VigilConfig,
    session_id: &str,
) -> Result<(DialecticSession, Vec<TranscriptEntry>), VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    let timeout = cfg.session_timeout_secs;

    // Lazy timeout needs a write; take it only when the session expired.
    let expired = broker.with_read(&db_path, |conn| {
        let session = load_session(conn, &session_owned)?;
        Ok(!session.phase.is_terminal()
            && time::now_secs() - time::parse_epoch_z(&session.updated_at) > timeout)
    })?;
    if expired {
        abort_expired(store, &session_owned)?;
    }

    broker.with_read(&db_path, |conn| {
        let session = load_session(conn, &session_owned)?;
        let transcript = load_transcript(conn, &session_owned)?;
        Ok((session, transcript))
    })
}

fn abort_expired(store: &Store, session_id: &str) -> Result<(), VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let session_owned = session_id.to_string();
    with_session_lease(store, session_id, SYSTEM_PARTY, || {
        broker.with_write(&db_path, SYSTEM_PARTY, "dialectic.timeout", |conn| {
            let session = load_session(conn, &session_owned)?;
            if session.phase.is_terminal() {
                return Ok(());
            }
            let now = time::now_epoch_z();
            insert_transcript(
                conn,
                &session.id,
                SYSTEM_PARTY,
                Phase::Aborted,
                &serde_json::json!({ "aborted": "inactivity timeout" }),
                &now,
            )?;
            // The paused agent stays paused: recovery needs a new request.
            advance_phase(conn, &session, Phase::Aborted, &now)
        })
    })
}

/// Background sweep aborting every ACTIVE session past the inactivity window.
/// Returns the number aborted.
pub fn sweep_timeouts(store: &Store, cfg: &VigilConfig) -> Result<usize, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let cutoff = time::now_secs() - cfg.session_timeout_secs;

    let expired: Vec<String> = broker.with_read(&db_path, |conn| {
        let mut stmt = conn.prepare("SELECT id, updated_at FROM sessions WHERE status = 'ACTIVE'")?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter(|(_, updated)| time::parse_epoch_z(updated) < cutoff)
            .map(|(id, _)| id)
            .collect())
    })?;

    let mut aborted = 0usize;
    for id in expired {
        abort_expired(store, &id)?;
        aborted += 1;
    }
    Ok(aborted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_index_roundtrip() {
        for p in [
            Phase::Requested,
            Phase::ReviewerAssigned,
            Phase::Thesis,
            Phase::Antithesis,
            Phase::Negotiation,
            Phase::Resolved,
            Phase::Aborted,
        ] {
            assert_eq!(Phase::from_index(p.index()), p);
        }
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Resolved.is_terminal());
        assert!(Phase::Aborted.is_terminal());
        assert!(!Phase::Negotiation.is_terminal());
    }

    #[test]
    fn test_payload_hash_stable() {
        let a = serde_json::json!({"conditions": {"max_complexity": 0.4}});
        let b = serde_json::json!({"conditions": {"max_complexity": 0.4}});
        assert_eq!(payload_hash(&a), payload_hash(&b));
        let c = serde_json::json!({"conditions": {"max_complexity": 0.5}});
        assert_ne!(payload_hash(&a), payload_hash(&c));
    }

    #[test]
    fn test_synthesized_antithesis_flags_elevated_metrics() {
        let mut state = AgentState::default_equilibrium("a", "0Z");
        state.entropy = 1.5;
        state.coherence = 0.1;
        let payload = synthesize_antithesis(&state);
        let concerns = payload["concerns"].as_array().unwrap();
        assert!(concerns.len() >= 2);
        assert_eq!(payload["self_recovery"], true);
    }
}
