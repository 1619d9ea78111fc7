//! Decision policy: verdict classification and adaptive sensitivity.
//!
//! Every governance cycle blends a complexity-derived signal with traditional
//! coherence/entropy thresholds into an attention score, classifies it into a
//! verdict tier, and emits a confidence estimate recorded for calibration.
//! A trailing-window regime classifier selects regime-appropriate thresholds
//! (exploration tolerates more entropy than a locked regime does). One
//! adaptive scalar, the entropy-drift sensitivity, is tuned once per cycle by
//! a discrete PI controller driven by the frequency of void events.

use crate::plugins::dynamics::{Regime, SENS_MAX, SENS_MIN, S_MAX, Snapshot, StateVector};
use serde::{Deserialize, Serialize};

/// |Void| crossing this threshold counts as a void event for the PI loop.
pub const VOID_EVENT_THRESHOLD: f64 = 2.0;
/// Target void-event rate over the trailing window.
pub const TARGET_VOID_RATE: f64 = 0.1;
/// Trailing window length for regime classification and the PI loop.
pub const TRAILING_WINDOW: usize = 8;
/// PI gains for the sensitivity controller.
pub const PI_KP: f64 = 0.8;
pub const PI_KI: f64 = 0.2;
/// Clamp on the PI integral accumulator (anti-windup).
pub const PI_INTEGRAL_CLAMP: f64 = 2.0;
/// Integrity below this is an unconditional halt regardless of attention.
pub const INTEGRITY_HALT_FLOOR: f64 = 0.05;

/// Verdict tiers as a tagged union: each tier carries only the fields valid
/// for it, so the policy's state space is explicit in the type system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "kebab-case")]
pub enum Verdict {
    Proceed,
    ProceedWithCaution { advisory: String },
    PauseForReview { reason: String },
    Halt { reason: String },
}

impl Verdict {
    pub fn tier(&self) -> &'static str {
        match self {
            Verdict::Proceed => "proceed",
            Verdict::ProceedWithCaution { .. } => "proceed-with-caution",
            Verdict::PauseForReview { .. } => "pause-for-review",
            Verdict::Halt { .. } => "halt",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Verdict::Proceed => "state within regime thresholds".to_string(),
            Verdict::ProceedWithCaution { advisory } => advisory.clone(),
            Verdict::PauseForReview { reason } => reason.clone(),
            Verdict::Halt { reason } => reason.clone(),
        }
    }

    /// Whether this tier blocks the agent (pause or halt).
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Verdict::PauseForReview { .. } | Verdict::Halt { .. }
        )
    }
}

/// One cycle's classification output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub confidence: f64,
    pub attention: f64,
    pub regime: Regime,
}

/// Regime-specific threshold set.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub entropy_ceiling: f64,
    pub coherence_floor: f64,
    pub caution: f64,
    pub pause: f64,
    pub halt: f64,
}

pub fn thresholds_for(regime: Regime) -> Thresholds {
    match regime {
        Regime::Exploration => Thresholds {
            entropy_ceiling: 1.4,
            coherence_floor: 0.25,
            caution: 0.55,
            pause: 0.75,
            halt: 0.90,
        },
        Regime::Transition => Thresholds {
            entropy_ceiling: 1.1,
            coherence_floor: 0.35,
            caution: 0.50,
            pause: 0.70,
            halt: 0.88,
        },
        Regime::Convergence => Thresholds {
            entropy_ceiling: 0.9,
            coherence_floor: 0.40,
            caution: 0.45,
            pause: 0.65,
            halt: 0.85,
        },
        Regime::Locked => Thresholds {
            entropy_ceiling: 0.7,
            coherence_floor: 0.50,
            caution: 0.40,
            pause: 0.60,
            halt: 0.80,
        },
    }
}

/// Classify the behavioral regime from the trailing window. With too little
/// history the agent is treated as converging, which uses the middle-of-road
/// threshold set.
pub fn classify_regime(history: &[Snapshot], current: &StateVector) -> Regime {
    let window: Vec<&Snapshot> = history
        .iter()
        .rev()
        .take(TRAILING_WINDOW)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if window.len() < 4 {
        return Regime::Convergence;
    }

    let n = window.len() as f64;
    let entropy_mean = window.iter().map(|s| s.entropy).sum::<f64>() / n;
    let coherence_mean = window.iter().map(|s| s.coherence).sum::<f64>() / n;
    let entropy_trend = current.entropy - window[0].entropy;
    let coherence_trend = current.coherence - window[0].coherence;

    if coherence_mean > 0.85 && entropy_mean < 0.2 && entropy_trend.abs() < 0.05 {
        return Regime::Locked;
    }
    if entropy_mean > 0.8 || entropy_trend > 0.2 {
        return Regime::Exploration;
    }
    if coherence_trend.abs() > 0.25 {
        return Regime::Transition;
    }
    Regime::Convergence
}

/// Attention score: configurable blend of the complexity-derived signal and
/// the traditional coherence/entropy threshold signal. Always in [0, 1].
pub fn attention_score(
    blend_ratio: f64,
    complexity: f64,
    v: &StateVector,
    th: &Thresholds,
) -> f64 {
    let coherence_deficit = if th.coherence_floor > 0.0 {
        ((th.coherence_floor - v.coherence) / th.coherence_floor).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let entropy_excess =
        ((v.entropy - th.entropy_ceiling) / (S_MAX - th.entropy_ceiling)).clamp(0.0, 1.0);
    let threshold_signal = coherence_deficit.max(entropy_excess);
    (blend_ratio * complexity + (1.0 - blend_ratio) * threshold_signal).clamp(0.0, 1.0)
}

/// Classify one cycle's post-step vector into a verdict with confidence.
pub fn decide(
    v: &StateVector,
    history: &[Snapshot],
    complexity: f64,
    blend_ratio: f64,
) -> Decision {
    let regime = classify_regime(history, v);
    let th = thresholds_for(regime);
    let attention = attention_score(blend_ratio, complexity, v, &th);

    let verdict = if v.integrity < INTEGRITY_HALT_FLOOR {
        Verdict::Halt {
            reason: format!(
                "integrity collapsed to {:.3}; halting regardless of attention",
                v.integrity
            ),
        }
    } else if attention >= th.halt {
        Verdict::Halt {
            reason: format!(
                "attention {:.2} over halt threshold {:.2} in {} regime",
                attention, th.halt, regime
            ),
        }
    } else if attention >= th.pause {
        Verdict::PauseForReview {
            reason: format!(
                "attention {:.2} over pause threshold {:.2} in {} regime",
                attention, th.pause, regime
            ),
        }
    } else if attention >= th.caution {
        Verdict::ProceedWithCaution {
            advisory: format!(
                "attention {:.2} approaching pause threshold {:.2}; reduce drift",
                attention, th.pause
            ),
        }
    } else {
        Verdict::Proceed
    };

    let confidence = confidence_of(attention, &th);
    Decision {
        verdict,
        confidence,
        attention,
        regime,
    }
}

/// Confidence is the normalized margin to the nearest verdict boundary,
/// mapped into [0.5, 0.99]: a score sitting on a boundary is a coin flip,
/// a score deep inside a band is near-certain.
fn confidence_of(attention: f64, th: &Thresholds) -> f64 {
    let margin = [th.caution, th.pause, th.halt]
        .iter()
        .map(|b| (attention - b).abs())
        .fold(f64::MAX, f64::min);
    (0.5 + margin * 2.0).clamp(0.5, 0.99)
}

/// One PI controller cycle for the entropy-drift sensitivity. Too-frequent
/// void events raise sensitivity, too-rare lower it, always clamped to the
/// safe band. Returns the new sensitivity and the updated integral term.
pub fn tune_sensitivity(
    sensitivity: f64,
    integral: f64,
    history: &[Snapshot],
    current_void: f64,
) -> (f64, f64) {
    let window: Vec<f64> = history
        .iter()
        .rev()
        .take(TRAILING_WINDOW - 1)
        .map(|s| s.void_)
        .chain(std::iter::once(current_void))
        .collect();
    if window.is_empty() {
        return (sensitivity, integral);
    }

    let events = window
        .iter()
        .filter(|v| v.abs() >= VOID_EVENT_THRESHOLD)
        .count() as f64;
    let rate = events / window.len() as f64;
    let error = rate - TARGET_VOID_RATE;
    let integral = (integral + error).clamp(-PI_INTEGRAL_CLAMP, PI_INTEGRAL_CLAMP);
    let sensitivity = (sensitivity + PI_KP * error + PI_KI * integral).clamp(SENS_MIN, SENS_MAX);
    (sensitivity, integral)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(energy: f64, integrity: f64, entropy: f64, void_: f64, coherence: f64) -> StateVector {
        StateVector {
            energy,
            integrity,
            entropy,
            void_,
            coherence,
        }
    }

    fn snap(entropy: f64, void_: f64, coherence: f64) -> Snapshot {
        Snapshot {
            energy: 0.7,
            integrity: 0.7,
            entropy,
            void_,
            coherence,
            ts: "0Z".to_string(),
        }
    }

    #[test]
    fn test_calm_state_proceeds() {
        let v = vector(0.7, 0.8, 0.2, 0.0, 1.0);
        let d = decide(&v, &[], 0.5, 0.4);
        assert_eq!(d.verdict, Verdict::Proceed);
        assert!(d.confidence >= 0.5 && d.confidence <= 0.99);
    }

    #[test]
    fn test_collapsed_integrity_halts() {
        let v = vector(0.5, 0.01, 0.3, 0.0, 1.0);
        let d = decide(&v, &[], 0.0, 0.4);
        assert!(matches!(d.verdict, Verdict::Halt { .. }));
    }

    #[test]
    fn test_high_entropy_low_coherence_pauses() {
        let v = vector(0.3, 0.4, 1.9, 5.0, 0.05);
        let d = decide(&v, &[], 0.9, 0.4);
        assert!(d.verdict.is_blocking(), "got {:?}", d.verdict);
    }

    #[test]
    fn test_attention_monotone_in_complexity() {
        let v = vector(0.7, 0.8, 0.2, 0.0, 1.0);
        let th = thresholds_for(Regime::Convergence);
        let low = attention_score(0.4, 0.1, &v, &th);
        let high = attention_score(0.4, 0.9, &v, &th);
        assert!(high > low);
    }

    #[test]
    fn test_exploration_tolerates_more_entropy() {
        let v = vector(0.6, 0.6, 1.2, 0.0, 0.9);
        let explore = attention_score(0.0, 0.0, &v, &thresholds_for(Regime::Exploration));
        let locked = attention_score(0.0, 0.0, &v, &thresholds_for(Regime::Locked));
        assert!(explore < locked);
    }

    #[test]
    fn test_regime_exploration_on_high_entropy() {
        let history: Vec<Snapshot> = (0..8).map(|_| snap(1.2, 0.0, 0.5)).collect();
        let v = vector(0.6, 0.6, 1.2, 0.0, 0.5);
        assert_eq!(classify_regime(&history, &v), Regime::Exploration);
    }

    #[test]
    fn test_regime_locked_on_quiet_history() {
        let history: Vec<Snapshot> = (0..8).map(|_| snap(0.1, 0.0, 0.95)).collect();
        let v = vector(0.8, 0.9, 0.1, 0.0, 0.95);
        assert_eq!(classify_regime(&history, &v), Regime::Locked);
    }

    #[test]
    fn test_regime_defaults_to_convergence_without_history() {
        let v = vector(0.7, 0.7, 0.3, 0.0, 1.0);
        assert_eq!(classify_regime(&[], &v), Regime::Convergence);
    }

    #[test]
    fn test_sensitivity_rises_with_frequent_void_events() {
        let history: Vec<Snapshot> = (0..8).map(|_| snap(0.3, 3.0, 0.3)).collect();
        let (sens, _) = tune_sensitivity(1.0, 0.0, &history, 3.0);
        assert!(sens > 1.0);
    }

    #[test]
    fn test_sensitivity_falls_without_void_events() {
        let history: Vec<Snapshot> = (0..8).map(|_| snap(0.3, 0.0, 1.0)).collect();
        let (sens, _) = tune_sensitivity(1.0, 0.0, &history, 0.0);
        assert!(sens < 1.0);
    }

    #[test]
    fn test_sensitivity_clamped_to_safe_band() {
        let spiky: Vec<Snapshot> = (0..8).map(|_| snap(0.3, 8.0, 0.1)).collect();
        let mut sens = 1.0;
        let mut integral = 0.0;
        for _ in 0..100 {
            let (s, i) = tune_sensitivity(sens, integral, &spiky, 8.0);
            sens = s;
            integral = i;
        }
        assert!(sens <= SENS_MAX);

        let calm: Vec<Snapshot> = (0..8).map(|_| snap(0.3, 0.0, 1.0)).collect();
        for _ in 0..100 {
            let (s, i) = tune_sensitivity(sens, integral, &calm, 0.0);
            sens = s;
            integral = i;
        }
        assert!(sens >= SENS_MIN);
    }
}
