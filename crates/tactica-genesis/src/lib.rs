//! # Tactica Genesis
//!
//! Population evolution for the Tactica decision engine.
//!
//! ## Cycle
//!
//! ```text
//! Idle → Pruning → Rebalancing → Allocating → Mutating → Minting → Idle
//! ```
//!
//! Low-ROI arms are pruned, the replicator converts per-niche fitness into
//! an exploration budget, and champions from the quality-diversity archive
//! are mutated into fresh candidate arms. Every candidate passes the safety
//! gate before it is minted; an unsafe variant is discarded, never minted.
//!
//! The cycle is a background maintenance loop: any step failing logs and
//! ends the cycle early, and partial progress is acceptable.

pub mod archive;
pub mod genesis;
pub mod mutation;
pub mod replicator;

pub use archive::{ArchiveStats, QdArchive};
pub use genesis::{CycleSummary, Genesis, GenesisPhase};
pub use mutation::mutate_graph;
pub use replicator::Replicator;

use serde::{Deserialize, Serialize};

/// Genesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Maximum arms minted per cycle, split across niches by the replicator
    pub total_budget: usize,
    /// Episodes an arm must have seen before it can be pruned
    pub min_trials: u64,
    /// Skip pruning entirely below this many eligible arms
    pub min_population: usize,
    /// Fraction of eligible arms pruned per cycle (bottom of the ROI order)
    pub prune_fraction: f64,
    /// Replicator learning rate (fitness EMA and share update)
    pub eta: f64,
    /// Champion-replacement hysteresis for the archive
    pub hysteresis_epsilon: f64,
    /// Standard deviation of the gaussian jitter applied to node params
    pub jitter_std: f64,
    /// Lower clamp for mutated params
    pub param_min: f64,
    /// Upper clamp for mutated params
    pub param_max: f64,
    /// Seconds between cycles
    pub cycle_interval_secs: u64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            total_budget: 8,
            min_trials: 10,
            min_population: 10,
            prune_fraction: 0.1,
            eta: 0.1,
            hysteresis_epsilon: 0.01,
            jitter_std: 0.15,
            param_min: 0.0,
            param_max: 2.0,
            cycle_interval_secs: 600,
        }
    }
}
