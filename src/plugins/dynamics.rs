//! Continuous state dynamics for governed agents.
//!
//! Each agent carries a four-variable continuous state advanced one timestep
//! per governance cycle by [`step`], a pure function of the previous state and
//! the cycle's inputs:
//!
//! - **Energy** relaxes toward Integrity.
//! - **Integrity** is eroded by entropy pressure and boosted by coherence
//!   feedback, with logistic self-limiting so it never reaches exactly 0 or 1.
//! - **Entropy** decays naturally, rises with drift magnitude and task
//!   complexity, and falls with coherence.
//! - **Void** accumulates the Energy–Integrity imbalance and decays
//!   exponentially.
//!
//! Coherence is a smooth bounded function of Void, saturating at `c_max` and
//! centered at Void = 0, which gives stabilizing negative feedback without
//! discontinuities. All outputs are clipped to documented ranges after
//! integration, so the system cannot diverge even from pathological starting
//! states. Invalid inputs are rejected before integration and never touch
//! persisted state.

use crate::core::error::VigilError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Entropy floor. Entropy below this is treated as corrupt.
pub const S_MIN: f64 = 0.05;
/// Entropy ceiling.
pub const S_MAX: f64 = 2.0;
/// Soft bound on |Void|.
pub const VOID_CLIP: f64 = 8.0;
/// Integrity is held strictly inside (0, 1); the logistic term alone cannot
/// guarantee that once f64 rounding collapses 1 - I to zero.
pub const INTEGRITY_EPS: f64 = 1e-6;
/// Safe band for the adaptive entropy-drift sensitivity.
pub const SENS_MIN: f64 = 0.2;
pub const SENS_MAX: f64 = 3.0;

/// Integration coefficients. Defaults are the tuned operating point; override
/// only in tests and experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Energy relaxation rate toward Integrity.
    pub k_e: f64,
    /// Coherence feedback gain on Integrity.
    pub k_c: f64,
    /// Entropy pressure gain on Integrity.
    pub k_s: f64,
    /// Natural entropy decay rate.
    pub lambda_s: f64,
    /// Complexity contribution to entropy.
    pub k_x: f64,
    /// Coherence damping of entropy.
    pub k_cs: f64,
    /// Void exponential decay rate.
    pub lambda_v: f64,
    /// Coherence saturation maximum.
    pub c_max: f64,
    /// Void scale at which coherence halves.
    pub v_scale: f64,
    /// Entropy level treated as neutral for integrity pressure.
    pub s_floor: f64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            k_e: 0.3,
            k_c: 0.8,
            k_s: 0.5,
            lambda_s: 0.5,
            k_x: 0.2,
            k_cs: 0.15,
            lambda_v: 0.4,
            c_max: 1.0,
            v_scale: 2.0,
            s_floor: S_MIN,
        }
    }
}

/// Behavioral regime tag, classified by the decision policy over a trailing
/// window and persisted with the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Exploration,
    Transition,
    Convergence,
    Locked,
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Exploration => write!(f, "EXPLORATION"),
            Regime::Transition => write!(f, "TRANSITION"),
            Regime::Convergence => write!(f, "CONVERGENCE"),
            Regime::Locked => write!(f, "LOCKED"),
        }
    }
}

impl Regime {
    pub fn parse(s: &str) -> Regime {
        match s {
            "EXPLORATION" => Regime::Exploration,
            "TRANSITION" => Regime::Transition,
            "LOCKED" => Regime::Locked,
            _ => Regime::Convergence,
        }
    }
}

/// One entry of the capped history ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub energy: f64,
    pub integrity: f64,
    pub entropy: f64,
    pub void_: f64,
    pub coherence: f64,
    pub ts: String,
}

/// Lifecycle status of an agent record. Records are never silently deleted,
/// only archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Active,
    Paused,
    Archived,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Paused => write!(f, "paused"),
            AgentStatus::Archived => write!(f, "archived"),
        }
    }
}

impl AgentStatus {
    pub fn parse(s: &str) -> AgentStatus {
        match s {
            "paused" => AgentStatus::Paused,
            "archived" => AgentStatus::Archived,
            _ => AgentStatus::Active,
        }
    }
}

/// Full per-agent behavioral record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub energy: f64,
    pub integrity: f64,
    pub entropy: f64,
    pub void_: f64,
    pub coherence: f64,
    pub sensitivity: f64,
    /// PI controller accumulator for the sensitivity loop.
    pub integral: f64,
    pub regime: Regime,
    pub status: AgentStatus,
    pub update_count: i64,
    pub history: Vec<Snapshot>,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentState {
    /// The documented safe default: a mildly sub-equilibrium start so a
    /// well-behaved agent climbs toward its bounds instead of sitting on them.
    pub fn default_equilibrium(agent_id: &str, now: &str) -> Self {
        let cfg = DynamicsConfig::default();
        let void_ = 0.0;
        Self {
            agent_id: agent_id.to_string(),
            energy: 0.6,
            integrity: 0.7,
            entropy: 0.3,
            void_,
            coherence: coherence_of(void_, &cfg),
            sensitivity: 1.0,
            integral: 0.0,
            regime: Regime::Convergence,
            status: AgentStatus::Active,
            update_count: 0,
            history: Vec::new(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
        }
    }

    /// Bounds check used by the self-healing load path.
    pub fn within_bounds(&self) -> bool {
        let finite = [
            self.energy,
            self.integrity,
            self.entropy,
            self.void_,
            self.coherence,
            self.sensitivity,
            self.integral,
        ]
        .iter()
        .all(|v| v.is_finite());
        finite
            && (0.0..=1.0).contains(&self.energy)
            && (0.0..=1.0).contains(&self.integrity)
            && (S_MIN..=S_MAX).contains(&self.entropy)
            && self.void_.abs() <= VOID_CLIP
            && (SENS_MIN..=SENS_MAX).contains(&self.sensitivity)
    }

    /// Push the current vector onto the ring buffer, dropping the oldest
    /// entry past `cap`.
    pub fn push_snapshot(&mut self, ts: &str, cap: usize) {
        self.history.push(Snapshot {
            energy: self.energy,
            integrity: self.integrity,
            entropy: self.entropy,
            void_: self.void_,
            coherence: self.coherence,
            ts: ts.to_string(),
        });
        if self.history.len() > cap {
            let excess = self.history.len() - cap;
            self.history.drain(0..excess);
        }
    }
}

/// The four integrated variables plus derived coherence, as produced by one
/// [`step`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub energy: f64,
    pub integrity: f64,
    pub entropy: f64,
    pub void_: f64,
    pub coherence: f64,
}

/// Bounded, smooth coherence response to Void: saturates at `c_max`, centered
/// at Void = 0.
pub fn coherence_of(void_: f64, cfg: &DynamicsConfig) -> f64 {
    cfg.c_max / (1.0 + (void_ / cfg.v_scale).powi(2))
}

/// Euclidean drift magnitude.
pub fn drift_magnitude(drift: &[f64]) -> f64 {
    drift.iter().map(|d| d * d).sum::<f64>().sqrt()
}

/// Reject invalid inputs before any integration. Rejection must not mutate
/// persisted state, so this runs before the store is touched.
pub fn validate_inputs(complexity: f64, drift: &[f64], dt: f64) -> Result<(), VigilError> {
    if !complexity.is_finite() || !(0.0..=1.0).contains(&complexity) {
        return Err(VigilError::ValidationError(format!(
            "complexity must be finite and in [0,1], got {}",
            complexity
        )));
    }
    if drift.iter().any(|d| !d.is_finite()) {
        return Err(VigilError::ValidationError(
            "drift vector contains non-finite components".to_string(),
        ));
    }
    if !dt.is_finite() || dt <= 0.0 {
        return Err(VigilError::ValidationError(format!(
            "dt must be finite and positive, got {}",
            dt
        )));
    }
    Ok(())
}

/// Advance the state one timestep. Deterministic, side-effect-free.
pub fn step(
    state: &AgentState,
    complexity: f64,
    drift: &[f64],
    dt: f64,
    cfg: &DynamicsConfig,
) -> Result<StateVector, VigilError> {
    validate_inputs(complexity, drift, dt)?;

    let e = state.energy;
    let i = state.integrity;
    let s = state.entropy;
    let v = state.void_;
    let c = coherence_of(v, cfg);
    let drift_mag = drift_magnitude(drift);

    let d_energy = cfg.k_e * (i - e) * dt;
    let d_integrity = (cfg.k_c * c - cfg.k_s * (s - cfg.s_floor)) * i * (1.0 - i) * dt;
    let d_entropy = (-cfg.lambda_s * s
        + state.sensitivity * drift_mag
        + cfg.k_x * complexity
        - cfg.k_cs * c)
        * dt;
    let d_void = ((e - i) - cfg.lambda_v * v) * dt;

    let energy = (e + d_energy).clamp(0.0, 1.0);
    let integrity = (i + d_integrity).clamp(INTEGRITY_EPS, 1.0 - INTEGRITY_EPS);
    let entropy = (s + d_entropy).clamp(S_MIN, S_MAX);
    let void_ = (v + d_void).clamp(-VOID_CLIP, VOID_CLIP);
    let coherence = coherence_of(void_, cfg);

    Ok(StateVector {
        energy,
        integrity,
        entropy,
        void_,
        coherence,
    })
}
