//! Episode types
//!
//! One episode covers a full selection-to-outcome cycle: the encoded request
//! context, the chosen arm with its per-candidate scores, and (once reported)
//! the observed outcome and its scalarized reward. Episodes are finalized at
//! most once and read-only thereafter.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw multi-dimensional outcome of executing an arm.
///
/// All components are raw observations; normalization and sign-flipping
/// (lower cost/latency/safety-hit is better) happen in the reward arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeVector {
    /// Task success degree, expected in [0, 1]
    pub success: f64,
    /// Resource cost, expected normalized to [0, 1] by the caller's meter
    pub cost: f64,
    /// Latency, expected normalized to [0, 1] against the caller's deadline
    pub latency: f64,
    /// Whether a safety violation was observed (0 or 1, fractional allowed)
    pub safety_hit: f64,
}

impl OutcomeVector {
    pub fn new(success: f64, cost: f64, latency: f64, safety_hit: f64) -> Self {
        Self {
            success,
            cost,
            latency,
            safety_hit,
        }
    }

    /// Components clipped to [0, 1], in (success, cost, latency, safety_hit)
    /// order
    pub fn clipped(&self) -> [f64; 4] {
        [
            clip01(self.success),
            clip01(self.cost),
            clip01(self.latency),
            clip01(self.safety_hit),
        ]
    }
}

fn clip01(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.0;
    }
    v.clamp(0.0, 1.0)
}

/// One selection-to-outcome cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Unique episode identifier
    pub id: Uuid,

    /// Encoded feature vector used at selection time
    pub feature_vector: Vec<f64>,

    /// Arm chosen for execution
    pub chosen_arm_id: String,

    /// Thompson-sampled score per candidate at selection time
    pub candidate_scores: BTreeMap<String, f64>,

    /// Observed outcome, set at finalization
    pub outcome: Option<OutcomeVector>,

    /// Scalarized reward, set at finalization
    pub scalar_reward: Option<f64>,

    /// When the selection was made
    pub created_at: DateTime<Utc>,

    /// When the outcome was reported
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Episode {
    /// Create an episode at selection time
    pub fn new(
        feature_vector: Vec<f64>,
        chosen_arm_id: impl Into<String>,
        candidate_scores: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            feature_vector,
            chosen_arm_id: chosen_arm_id.into(),
            candidate_scores,
            outcome: None,
            scalar_reward: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }

    /// Attach the observed outcome. The first call wins; a second call is
    /// ignored and returns false.
    pub fn finalize(&mut self, outcome: OutcomeVector, scalar_reward: f64) -> bool {
        if self.finalized_at.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        self.scalar_reward = Some(scalar_reward);
        self.finalized_at = Some(Utc::now());
        true
    }

    /// True once the outcome has been reported
    pub fn is_finalized(&self) -> bool {
        self.finalized_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipped_bounds_and_nan() {
        let v = OutcomeVector::new(1.5, -0.2, f64::NAN, 0.5);
        let [s, c, l, h] = v.clipped();
        assert_eq!(s, 1.0);
        assert_eq!(c, 0.0);
        assert_eq!(l, 0.0);
        assert_eq!(h, 0.5);
    }

    #[test]
    fn test_finalize_once() {
        let mut ep = Episode::new(vec![1.0, 0.0], "arm-1", BTreeMap::new());
        assert!(!ep.is_finalized());

        assert!(ep.finalize(OutcomeVector::new(1.0, 0.1, 0.2, 0.0), 0.8));
        assert!(ep.is_finalized());
        assert_eq!(ep.scalar_reward, Some(0.8));

        // second finalize is ignored
        assert!(!ep.finalize(OutcomeVector::new(0.0, 0.9, 0.9, 1.0), -0.5));
        assert_eq!(ep.scalar_reward, Some(0.8));
    }
}
