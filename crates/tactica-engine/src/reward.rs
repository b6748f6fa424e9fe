//! Multi-dimensional reward reduction
//!
//! Reduces a (success, cost, latency, safety-hit) outcome to a single scalar
//! via runtime-updatable scalarization weights. The arbiter never fits the
//! weights itself; an external preference-learning process replaces them
//! wholesale. The scalar is squashed through `tanh` so no weight
//! configuration can push rewards outside [-1, 1] and destabilize the
//! bandit updates downstream.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tactica_common::{OutcomeVector, Result, TacticaError};

/// Scalarization weights, one per outcome component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    pub success: f64,
    pub cost: f64,
    pub latency: f64,
    pub safety: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            success: 1.0,
            cost: 0.3,
            latency: 0.2,
            safety: 1.0,
        }
    }
}

impl RewardWeights {
    fn is_valid(&self) -> bool {
        [self.success, self.cost, self.latency, self.safety]
            .iter()
            .all(|w| w.is_finite())
    }
}

/// Applies scalarization weights to observed outcomes
pub struct RewardArbiter {
    weights: RwLock<RewardWeights>,
}

impl RewardArbiter {
    pub fn new(weights: RewardWeights) -> Self {
        Self {
            weights: RwLock::new(weights),
        }
    }

    /// Normalize an outcome into a higher-is-better vector:
    /// components clipped to [0, 1], then cost/latency/safety-hit negated.
    pub fn compute_vector(&self, outcome: &OutcomeVector) -> [f64; 4] {
        let [s, c, l, h] = outcome.clipped();
        [s, -c, -l, -h]
    }

    /// Weighted linear combination squashed into [-1, 1]
    pub fn scalarize(&self, vector: &[f64; 4]) -> f64 {
        let w = *self.weights.read();
        let raw = w.success * vector[0]
            + w.cost * vector[1]
            + w.latency * vector[2]
            + w.safety * vector[3];
        raw.tanh()
    }

    /// Convenience: normalize and scalarize in one step
    pub fn score(&self, outcome: &OutcomeVector) -> f64 {
        let vector = self.compute_vector(outcome);
        self.scalarize(&vector)
    }

    /// Atomically replace the weights wholesale.
    ///
    /// Partial updates are not supported; the external preference learner
    /// always ships a full set.
    pub fn set_weights(&self, weights: RewardWeights) -> Result<()> {
        if !weights.is_valid() {
            return Err(TacticaError::Config(
                "reward weights must all be finite".to_string(),
            ));
        }
        debug!(?weights, "reward weights replaced");
        *self.weights.write() = weights;
        Ok(())
    }

    pub fn weights(&self) -> RewardWeights {
        *self.weights.read()
    }
}

impl Default for RewardArbiter {
    fn default() -> Self {
        Self::new(RewardWeights::default())
    }
}
