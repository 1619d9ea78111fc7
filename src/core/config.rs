//! Workspace configuration.
//!
//! Tuned constants live here rather than as literals scattered through the
//! policy and coordinator code: the signal blend ratio and the collusion
//! window were observed, not derived, so they are configuration validated
//! against the governed invariants. Loaded from `<workspace>/.vigil/config.toml`
//! when present; every field has a default and every override is validated on
//! load — an out-of-range value is a `ValidationError`, never a silent default.

use crate::core::error::VigilError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Weight of the complexity-derived signal in the attention score blend.
    pub blend_ratio: f64,
    /// Collusion-avoidance window: an agent that reviewed this requester in
    /// the last K sessions is ineligible.
    pub collusion_window_k: i64,
    /// Maximum negotiation rounds before auto-abort.
    pub max_negotiation_rounds: i64,
    /// Dialectic session inactivity timeout, seconds.
    pub session_timeout_secs: i64,
    /// Per-agent lease TTL, seconds.
    pub lease_ttl_secs: i64,
    /// Bounded wait when acquiring a contended lease, milliseconds.
    pub lease_wait_ms: u64,
    /// Per-agent write-rate limit, updates per minute.
    pub rate_limit_per_minute: i64,
    /// Age after which a decision's outcome is considered observable, seconds.
    pub outcome_delay_secs: i64,
    /// Maximum decisions back-filled per calibration sweep.
    pub backfill_batch: i64,
    /// Snapshots retained in the per-agent history ring buffer.
    pub history_cap: usize,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            blend_ratio: 0.4,
            collusion_window_k: 3,
            max_negotiation_rounds: 5,
            session_timeout_secs: 3600,
            lease_ttl_secs: 30,
            lease_wait_ms: 2_000,
            rate_limit_per_minute: 120,
            outcome_delay_secs: 900,
            backfill_batch: 64,
            history_cap: 64,
        }
    }
}

impl VigilConfig {
    /// Load from `<workspace>/.vigil/config.toml`, falling back to defaults
    /// when the file is absent.
    pub fn load(workspace: &Path) -> Result<Self, VigilError> {
        let path = workspace.join(".vigil").join("config.toml");
        let config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(VigilError::IoError)?;
            toml::from_str::<VigilConfig>(&content)
                .map_err(|e| VigilError::ValidationError(format!("config parse: {e}")))?
        } else {
            VigilConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VigilError> {
        if !(0.0..=1.0).contains(&self.blend_ratio) || !self.blend_ratio.is_finite() {
            return Err(VigilError::ValidationError(format!(
                "blend_ratio must be in [0,1], got {}",
                self.blend_ratio
            )));
        }
        if self.collusion_window_k < 1 {
            return Err(VigilError::ValidationError(
                "collusion_window_k must be >= 1".to_string(),
            ));
        }
        if self.max_negotiation_rounds < 1 {
            return Err(VigilError::ValidationError(
                "max_negotiation_rounds must be >= 1".to_string(),
            ));
        }
        if self.session_timeout_secs < 1 || self.lease_ttl_secs < 1 {
            return Err(VigilError::ValidationError(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.rate_limit_per_minute < 1 {
            return Err(VigilError::ValidationError(
                "rate_limit_per_minute must be >= 1".to_string(),
            ));
        }
        if self.outcome_delay_secs < 0 || self.backfill_batch < 1 {
            return Err(VigilError::ValidationError(
                "calibration backfill settings out of range".to_string(),
            ));
        }
        if self.history_cap == 0 {
            return Err(VigilError::ValidationError(
                "history_cap must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        VigilConfig::default().validate().unwrap();
    }

    #[test]
    fn test_blend_ratio_out_of_range_rejected() {
        let mut cfg = VigilConfig::default();
        cfg.blend_ratio = 1.5;
        assert!(cfg.validate().is_err());
        cfg.blend_ratio = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_collusion_window_must_be_positive() {
        let mut cfg = VigilConfig::default();
        cfg.collusion_window_k = 0;
        assert!(cfg.validate().is_err());
    }
}
