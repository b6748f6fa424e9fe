//! Behavior-space niche descriptors
//!
//! A niche is a tuple of low-cardinality strings computed deterministically
//! from an episode's context and outcome. It is only ever used as a key into
//! the Quality-Diversity archive.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A behavior-space descriptor: (task family, risk tier, cost tier)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Niche {
    pub task_family: String,
    pub risk_tier: String,
    pub cost_tier: String,
}

impl Niche {
    pub fn new(
        task_family: impl Into<String>,
        risk_tier: impl Into<String>,
        cost_tier: impl Into<String>,
    ) -> Self {
        Self {
            task_family: task_family.into(),
            risk_tier: risk_tier.into(),
            cost_tier: cost_tier.into(),
        }
    }

    /// Deterministic descriptor from an episode's mode, declared risk level
    /// and observed (normalized) cost.
    pub fn describe(mode: &str, risk_level: &str, cost: f64) -> Self {
        Self::new(mode, risk_level, cost_tier(cost))
    }
}

/// Bucket a normalized cost into a coarse tier
fn cost_tier(cost: f64) -> &'static str {
    if !cost.is_finite() || cost < 0.0 {
        return "unknown";
    }
    if cost < 0.33 {
        "low"
    } else if cost < 0.66 {
        "mid"
    } else {
        "high"
    }
}

impl fmt::Display for Niche {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.task_family, self.risk_tier, self.cost_tier)
    }
}
