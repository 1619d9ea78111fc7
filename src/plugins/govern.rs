//! Governance service: the composition root of one governance cycle.
//!
//! `update` is the single entry point agents call before acting: it locks the
//! agent record, loads and heals state, advances the dynamics one step,
//! classifies a verdict, tunes sensitivity, appends the decision to the audit
//! trail, persists everything in one transaction, and releases the lock.
//! Every cycle, including a halt, returns a complete structured report —
//! never a bare failure with no actionable content.

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
use crate::plugins::dynamics::{self, AgentStatus, Regime, StateVector};
use crate::plugins::policy::{self, Verdict};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Timestep per governance cycle. Trajectories are therefore dominated by
/// update count rather than wall time; see DESIGN.md on the open calibration
/// concern.
pub const CYCLE_DT: f64 = 1.0;
/// Gain applied to the calibration overconfidence signal when trimming
/// sensitivity.
const CALIBRATION_TRIM_GAIN: f64 = 0.3;

/// Structured observation reported by the agent for one cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    /// Drift vector: per-dimension deviation signals since the last update.
    #[serde(default)]
    pub drift: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Complete structured response for one governance cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceReport {
    pub agent_id: String,
    pub decision_id: String,
    pub verdict: Verdict,
    pub reason: String,
    pub confidence: f64,
    pub attention: f64,
    pub regime: Regime,
    pub state: StateVector,
    pub sensitivity: f64,
    pub update_count: i64,
    /// True when this cycle lazily created the agent record.
    pub created: bool,
    /// Self-healing and other non-fatal conditions (corrupt-state resets).
    pub warnings: Vec<String>,
    pub ts: String,
}

/// Run one governance cycle for an agent.
pub fn update(
    store: &Store,
    cfg: &VigilConfig,
    agent_id: &str,
    token: &str,
    observation: &Observation,
    complexity: Option<f64>,
) -> Result<GovernanceReport, VigilError> {
    // Credential and input validation both precede any state mutation.
    auth::verify_token(store, agent_id, token)?;
    let complexity = complexity.unwrap_or(0.5);
    dynamics::validate_inputs(complexity, &observation.drift, CYCLE_DT)?;

    // Each call presents its own lease identity: holder equality grants
    // renew/release, never concurrent entry for a second caller.
    let holder = format!("{agent_id}:{}", time::new_event_id());
    let lease = Lease::acquire(
        store,
        &format!("agent/{agent_id}"),
        &holder,
        cfg.lease_ttl_secs,
        Duration::from_millis(cfg.lease_wait_ms),
    )?;
    let result = cycle(store, cfg, agent_id, observation, complexity);
    lease.release()?;
    result
}

fn cycle(
    store: &Store,
    cfg: &VigilConfig,
    agent_id: &str,
    observation: &Observation,
    complexity: f64,
) -> Result<GovernanceReport, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let agent = agent_id.to_string();
    let drift = observation.drift.clone();
    let history_cap = cfg.history_cap;
    let blend = cfg.blend_ratio;
    let rate_limit = cfg.rate_limit_per_minute;
    let dyn_cfg = dynamics::DynamicsConfig::default();

    broker.with_write(&db_path, &agent, "govern.update", |conn| {
        let now = time::now_epoch_z();
        index::check_rate_limit(conn, &agent, rate_limit, time::now_secs())?;

        let (mut state, warnings, created) = agents::get_or_create(conn, &agent, &now)?;
        if state.status == AgentStatus::Archived {
            return Err(VigilError::ProtocolError(format!(
                "agent '{}' is archived; archived agents accept no updates",
                agent
            )));
        }

        let vector = dynamics::step(&state, complexity, &drift, CYCLE_DT, &dyn_cfg)?;
        let decision = policy::decide(&vector, &state.history, complexity, blend);

        // Sensitivity: PI loop on void-event frequency, then a slow trim from
        // the calibration overconfidence signal. Calibration never gates the
        // verdict itself.
        let (mut sensitivity, integral) = policy::tune_sensitivity(
            state.sensitivity,
            state.integral,
            &state.history,
            vector.void_,
        );
        let overconfidence = calibration::overconfidence(conn)?;
        sensitivity = (sensitivity + CALIBRATION_TRIM_GAIN * overconfidence)
            .clamp(dynamics::SENS_MIN, dynamics::SENS_MAX);

        state.energy = vector.energy;
        state.integrity = vector.integrity;
        state.entropy = vector.entropy;
        state.void_ = vector.void_;
        state.coherence = vector.coherence;
        state.sensitivity = sensitivity;
        state.integral = integral;
        state.regime = decision.regime;
        state.update_count += 1;
        state.updated_at = now.clone();
        if decision.verdict.is_blocking() {
            state.status = AgentStatus::Paused;
        }
        state.push_snapshot(&now, history_cap);
        agents::save_state(conn, &state)?;

        let decision_id = time::new_event_id();
        conn.execute(
            "INSERT INTO decisions(id, agent_id, verdict, reason, confidence, attention, regime, ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                decision_id,
                agent,
                decision.verdict.tier(),
                decision.verdict.reason(),
                decision.confidence,
                decision.attention,
                decision.regime.to_string(),
                now
            ],
        )?;
        calibration::record_decision_sample(conn, &decision_id, decision.confidence, &now)?;

        index::upsert(
            conn,
            &agent,
            &state.status.to_string(),
            Some(decision.verdict.tier()),
            &now,
        )?;

        Ok(GovernanceReport {
            agent_id: agent.clone(),
            decision_id,
            reason: decision.verdict.reason(),
            verdict: decision.verdict,
            confidence: decision.confidence,
            attention: decision.attention,
            regime: decision.regime,
            state: vector,
            sensitivity,
            update_count: state.update_count,
            created,
            warnings,
            ts: now,
        })
    })
}

/// Aggregate read-only workspace summary over the metadata index. Served
/// through the TTL cache, so it tolerates bounded staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub ts: String,
    pub agents: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_verdict: BTreeMap<String, usize>,
    pub active_sessions: usize,
    pub alerts: Vec<String>,
}

pub fn status(store: &Store) -> Result<StatusSummary, VigilError> {
    let entries = index::list(store)?;
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_verdict: BTreeMap<String, usize> = BTreeMap::new();
    for e in &entries {
        *by_status.entry(e.status.clone()).or_insert(0) += 1;
        if let Some(v) = &e.last_verdict {
            *by_verdict.entry(v.clone()).or_insert(0) += 1;
        }
    }

    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let (active_sessions, orphaned_paused) = broker.with_read(&db_path, |conn| {
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = 'ACTIVE'",
            [],
            |row| row.get(0),
        )?;
        let orphaned: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_states a
             WHERE a.status = 'paused'
               AND NOT EXISTS (SELECT 1 FROM sessions s
                               WHERE s.agent_id = a.agent_id AND s.status = 'ACTIVE')",
            [],
            |row| row.get(0),
        )?;
        Ok((active as usize, orphaned as usize))
    })?;

    let mut alerts = Vec::new();
    if orphaned_paused > 0 {
        alerts.push(format!(
            "{} paused agent(s) have no active review session; they stay paused until one is requested",
            orphaned_paused
        ));
    }
    if let Some(halted) = by_verdict.get("halt") {
        if *halted > 0 {
            alerts.push(format!("{} agent(s) last verdict was halt", halted));
        }
    }

    Ok(StatusSummary {
        ts: time::now_epoch_z(),
        agents: entries.len(),
        by_status,
        by_verdict,
        active_sessions,
        alerts,
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "govern",
        "version": "0.1.0",
        "description": "Governance cycles: state dynamics, verdicts, audit trail",
        "commands": [
            { "name": "update", "parameters": ["agent", "token", "complexity", "drift"] },
            { "name": "status", "description": "Aggregate workspace summary" }
        ],
        "storage": ["vigil.db", "broker.events.jsonl"]
    })
}
