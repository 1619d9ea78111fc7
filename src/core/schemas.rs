//! Centralized database schema definitions for the governance bin.
//!
//! Vigil keeps all governed state in one consolidated SQLite database:
//! `vigil.db`. Tables:
//! - `agent_states`: one mutable record per agent (current vector + bounded history)
//! - `agent_index`: metadata index (status, last verdict, write-rate window)
//! - `decisions`: append-only verdict audit trail
//! - `calibration_samples`: confidence-bucketed accuracy samples
//! - `sessions` / `session_transcript`: dialectic sessions and their submissions
//! - `reviewer_history`: who reviewed whom, for collusion avoidance
//! - `leases`: per-resource write leases with heartbeat + TTL
//! - `credentials`: per-agent token digests
//! - `meta`: schema version and misc keys

pub const VIGIL_DB_NAME: &str = "vigil.db";
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const SCHEMA_AGENT_STATES: &str = "
    CREATE TABLE IF NOT EXISTS agent_states (
        agent_id TEXT PRIMARY KEY,
        energy REAL NOT NULL,
        integrity REAL NOT NULL,
        entropy REAL NOT NULL,
        void REAL NOT NULL,
        coherence REAL NOT NULL,
        sensitivity REAL NOT NULL,
        integral REAL NOT NULL DEFAULT 0.0,
        regime TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active', -- active | paused | archived
        update_count INTEGER NOT NULL DEFAULT 0,
        history TEXT NOT NULL DEFAULT '[]',    -- JSON ring buffer of snapshots
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const SCHEMA_AGENT_INDEX: &str = "
    CREATE TABLE IF NOT EXISTS agent_index (
        agent_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        last_verdict TEXT,
        last_update TEXT,
        window_start INTEGER NOT NULL DEFAULT 0,
        window_count INTEGER NOT NULL DEFAULT 0
    )
";

pub const SCHEMA_DECISIONS: &str = "
    CREATE TABLE IF NOT EXISTS decisions (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        verdict TEXT NOT NULL,
        reason TEXT NOT NULL,
        confidence REAL NOT NULL,
        attention REAL NOT NULL,
        regime TEXT NOT NULL,
        ts TEXT NOT NULL,
        outcome INTEGER,                        -- NULL until back-filled; 1 correct, 0 incorrect
        backfilled INTEGER NOT NULL DEFAULT 0
    )
";
pub const SCHEMA_DECISIONS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_decisions_agent_ts ON decisions(agent_id, ts)";

pub const SCHEMA_CALIBRATION_SAMPLES: &str = "
    CREATE TABLE IF NOT EXISTS calibration_samples (
        id TEXT PRIMARY KEY,
        decision_id TEXT,
        session_id TEXT,
        bucket INTEGER NOT NULL,                -- confidence decile 0..9
        confidence REAL NOT NULL,
        predicted_correct INTEGER NOT NULL,
        actual_correct INTEGER,                 -- NULL until back-filled
        weight REAL NOT NULL DEFAULT 1.0,
        created_at TEXT NOT NULL
    )
";

pub const SCHEMA_SESSIONS: &str = "
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        reviewer_id TEXT,
        kind TEXT NOT NULL,                     -- recovery | verification
        phase INTEGER NOT NULL,
        rounds INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'ACTIVE',  -- ACTIVE | RESOLVED | ABORTED
        reason TEXT NOT NULL,
        proposed_conditions TEXT,               -- JSON
        proposed_by TEXT,                       -- party that proposed them
        accepted_conditions TEXT,               -- JSON
        self_recovery INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const SCHEMA_SESSION_TRANSCRIPT: &str = "
    CREATE TABLE IF NOT EXISTS session_transcript (
        event_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        party TEXT NOT NULL,                    -- agent id of the submitter
        phase INTEGER NOT NULL,
        payload TEXT NOT NULL,                  -- JSON
        payload_hash TEXT NOT NULL,             -- sha256 of canonical payload
        ts TEXT NOT NULL,
        FOREIGN KEY(session_id) REFERENCES sessions(id)
    )
";
pub const SCHEMA_TRANSCRIPT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transcript_session ON session_transcript(session_id)";

pub const SCHEMA_REVIEWER_HISTORY: &str = "
    CREATE TABLE IF NOT EXISTS reviewer_history (
        session_id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,                 -- the reviewed (requesting) agent
        reviewer_id TEXT NOT NULL,
        ts TEXT NOT NULL
    )
";

pub const SCHEMA_LEASES: &str = "
    CREATE TABLE IF NOT EXISTS leases (
        resource TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        heartbeat INTEGER NOT NULL,             -- unix seconds of last renewal
        ttl_seconds INTEGER NOT NULL
    )
";

pub const SCHEMA_CREDENTIALS: &str = "
    CREATE TABLE IF NOT EXISTS credentials (
        agent_id TEXT PRIMARY KEY,
        token_digest TEXT NOT NULL,             -- hex sha256 of the issued token
        issued_at TEXT NOT NULL
    )
";

pub const ALL_SCHEMAS: &[&str] = &[
    SCHEMA_META,
    SCHEMA_AGENT_STATES,
    SCHEMA_AGENT_INDEX,
    SCHEMA_DECISIONS,
    SCHEMA_DECISIONS_INDEX,
    SCHEMA_CALIBRATION_SAMPLES,
    SCHEMA_SESSIONS,
    SCHEMA_SESSION_TRANSCRIPT,
    SCHEMA_TRANSCRIPT_INDEX,
    SCHEMA_REVIEWER_HISTORY,
    SCHEMA_LEASES,
    SCHEMA_CREDENTIALS,
];
