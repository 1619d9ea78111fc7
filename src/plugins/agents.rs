//! Agent record persistence.
//!
//! One row per agent in `agent_states`, created lazily on first update and
//! never deleted, only archived. The load path is self-healing: a record that
//! fails bounds/NaN validation is reset to the default equilibrium and the
//! reset is surfaced to the caller as a corrupt-state warning, never silent
//! data loss. Functions taking `&Connection` compose inside the caller's
//! broker transaction; store-level wrappers open their own.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::VigilError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::dynamics::{AgentState, AgentStatus, Regime, Snapshot};
use rusqlite::{Connection, OptionalExtension, Row, params};

fn state_from_row(row: &Row) -> Result<AgentState, rusqlite::Error> {
    let regime: String = row.get(8)?;
    let status: String = row.get(9)?;
    let history_json: String = row.get(11)?;
    let history: Vec<Snapshot> = serde_json::from_str(&history_json).unwrap_or_default();
    Ok(AgentState {
        agent_id: row.get(0)?,
        energy: row.get(1)?,
        integrity: row.get(2)?,
        entropy: row.get(3)?,
        void_: row.get(4)?,
        coherence: row.get(5)?,
        sensitivity: row.get(6)?,
        integral: row.get(7)?,
        regime: Regime::parse(&regime),
        status: AgentStatus::parse(&status),
        update_count: row.get(10)?,
        history,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const STATE_COLUMNS: &str = "agent_id, energy, integrity, entropy, void, coherence, sensitivity, \
     integral, regime, status, update_count, history, created_at, updated_at";

/// Load an agent's state, healing corrupt records. Returns the (possibly
/// reset) state plus any corrupt-state warning produced by the heal.
pub fn load_state(
    conn: &Connection,
    agent_id: &str,
) -> Result<Option<(AgentState, Vec<String>)>, VigilError> {
    let loaded: Option<AgentState> = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM agent_states WHERE agent_id = ?1"),
            params![agent_id],
            |row| state_from_row(row),
        )
        .optional()?;

    let Some(state) = loaded else {
        return Ok(None);
    };

    let mut warnings = Vec::new();
    let state = if state.within_bounds() {
        state
    } else {
        let err = VigilError::CorruptState(format!(
            "agent '{}' state failed bounds validation (energy={}, integrity={}, entropy={}, void={}); reset to default equilibrium",
            agent_id, state.energy, state.integrity, state.entropy, state.void_
        ));
        warnings.push(err.to_string());
        let now = time::now_epoch_z();
        let mut healed = AgentState::default_equilibrium(agent_id, &now);
        // Lifecycle fields survive the heal; only the vector and history reset.
        healed.status = state.status;
        healed.update_count = state.update_count;
        healed.created_at = state.created_at;
        healed
    };
    Ok(Some((state, warnings)))
}

/// Load or lazily create the agent record. Returns `(state, warnings, created)`.
pub fn get_or_create(
    conn: &Connection,
    agent_id: &str,
    now: &str,
) -> Result<(AgentState, Vec<String>, bool), VigilError> {
    if let Some((state, warnings)) = load_state(conn, agent_id)? {
        return Ok((state, warnings, false));
    }
    let state = AgentState::default_equilibrium(agent_id, now);
    save_state(conn, &state)?;
    Ok((state, Vec::new(), true))
}

/// Upsert the full record.
pub fn save_state(conn: &Connection, state: &AgentState) -> Result<(), VigilError> {
    let history = serde_json::to_string(&state.history)
        .map_err(|e| VigilError::ValidationError(format!("history serialize: {e}")))?;
    conn.execute(
        "INSERT INTO agent_states(agent_id, energy, integrity, entropy, void, coherence, \
             sensitivity, integral, regime, status, update_count, history, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(agent_id) DO UPDATE SET
             energy = excluded.energy,
             integrity = excluded.integrity,
             entropy = excluded.entropy,
             void = excluded.void,
             coherence = excluded.coherence,
             sensitivity = excluded.sensitivity,
             integral = excluded.integral,
             regime = excluded.regime,
             status = excluded.status,
             update_count = excluded.update_count,
             history = excluded.history,
             updated_at = excluded.updated_at",
        params![
            state.agent_id,
            state.energy,
            state.integrity,
            state.entropy,
            state.void_,
            state.coherence,
            state.sensitivity,
            state.integral,
            state.regime.to_string(),
            state.status.to_string(),
            state.update_count,
            history,
            state.created_at,
            state.updated_at,
        ],
    )?;
    Ok(())
}

/// Set only the lifecycle status inside the caller's transaction.
pub fn set_status(
    conn: &Connection,
    agent_id: &str,
    status: AgentStatus,
    now: &str,
) -> Result<(), VigilError> {
    let changed = conn.execute(
        "UPDATE agent_states SET status = ?1, updated_at = ?2 WHERE agent_id = ?3",
        params![status.to_string(), now, agent_id],
    )?;
    if changed == 0 {
        return Err(VigilError::NotFound(format!("agent '{}'", agent_id)));
    }
    Ok(())
}

/// All non-archived agent records, for reviewer candidate scans and status
/// summaries.
pub fn load_all(store: &Store) -> Result<Vec<AgentState>, VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    broker.with_read(&db_path, |conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM agent_states WHERE status != 'archived' ORDER BY agent_id"
        ))?;
        let iter = stmt.query_map([], |row| state_from_row(row))?;
        iter.collect::<Result<Vec<_>, _>>()
            .map_err(VigilError::RusqliteError)
    })
}

/// Archive an agent. The record stays on disk; it just stops participating.
pub fn archive(store: &Store, agent_id: &str) -> Result<(), VigilError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::vigil_db_path(&store.root);
    let agent = agent_id.to_string();
    broker.with_write(&db_path, &agent, "agents.archive", |conn| {
        let now = time::now_epoch_z();
        set_status(conn, &agent, AgentStatus::Archived, &now)?;
        crate::core::index::set_status(conn, &agent, "archived")?;
        Ok(())
    })
}
