//! Engine configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Tunables for the selection core.
///
/// Hysteresis epsilon, forgetting factor and the OOD threshold are global
/// rather than per-mode; nothing in observed behavior justifies per-mode
/// values yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Feature vector dimensionality (includes the reserved bias coordinate)
    pub feature_dim: usize,
    /// Ridge prior strength for fresh bandit heads (lambda > 0)
    pub lambda: f64,
    /// Exponential forgetting factor for bandit updates, in (0, 1]
    pub forgetting: f64,
    /// Rewards above this feed the episodic warm-start index
    pub success_threshold: f64,
    /// Selection settings
    pub selection: SelectionSettings,
    /// Episodic index settings
    pub episodic: EpisodicSettings,
    /// Distribution-shift detector settings
    pub ood: OodSettings,
    /// Persistence flusher settings
    pub persistence: PersistenceSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feature_dim: crate::DEFAULT_FEATURE_DIM,
            lambda: crate::DEFAULT_LAMBDA,
            forgetting: crate::DEFAULT_FORGETTING,
            success_threshold: crate::DEFAULT_SUCCESS_THRESHOLD,
            selection: SelectionSettings::default(),
            episodic: EpisodicSettings::default(),
            ood: OodSettings::default(),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables (with `.env` support)
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        if let Ok(val) = std::env::var("TACTICA_FEATURE_DIM") {
            if let Ok(v) = val.parse() {
                cfg.feature_dim = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_LAMBDA") {
            if let Ok(v) = val.parse() {
                cfg.lambda = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_FORGETTING") {
            if let Ok(v) = val.parse() {
                cfg.forgetting = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_SUCCESS_THRESHOLD") {
            if let Ok(v) = val.parse() {
                cfg.success_threshold = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_EXPLORATION_SAMPLE") {
            if let Ok(v) = val.parse() {
                cfg.selection.exploration_sample = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_WARM_START_K") {
            if let Ok(v) = val.parse() {
                cfg.selection.warm_start_k = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_OOD_THRESHOLD") {
            if let Ok(v) = val.parse() {
                cfg.ood.threshold = v;
            }
        }
        if let Ok(val) = std::env::var("TACTICA_FLUSH_INTERVAL_SECS") {
            if let Ok(v) = val.parse() {
                cfg.persistence.flush_interval_secs = v;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the core cannot operate under
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.feature_dim >= 2, "feature_dim must be >= 2 (bias + data)");
        anyhow::ensure!(
            self.lambda.is_finite() && self.lambda > 0.0,
            "lambda must be positive"
        );
        anyhow::ensure!(
            self.forgetting > 0.0 && self.forgetting <= 1.0,
            "forgetting must be in (0, 1]"
        );
        Ok(())
    }
}

/// Candidate-set and scoring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSettings {
    /// Warm-start suggestions pulled from the episodic index per request
    pub warm_start_k: usize,
    /// Deterministically sampled extra candidates from the mode pool
    pub exploration_sample: usize,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            warm_start_k: 3,
            exploration_sample: 5,
        }
    }
}

/// Episodic warm-start index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodicSettings {
    /// Maximum retained episodes (oldest evicted first)
    pub capacity: usize,
}

impl Default for EpisodicSettings {
    fn default() -> Self {
        Self { capacity: 2048 }
    }
}

/// Distribution-shift detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OodSettings {
    /// Mahalanobis distance beyond which a context is flagged
    pub threshold: f64,
    /// Minimum samples before the detector reports at all
    pub min_samples: usize,
    /// Seconds between background distribution refreshes
    pub refresh_interval_secs: u64,
}

impl Default for OodSettings {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_OOD_THRESHOLD,
            min_samples: crate::DEFAULT_OOD_MIN_SAMPLES,
            refresh_interval_secs: 300,
        }
    }
}

/// Dirty-state flusher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceSettings {
    /// Seconds between flush cycles
    pub flush_interval_secs: u64,
    /// Maximum dirty arms drained per cycle
    pub flush_batch_size: usize,
    /// Drain retries allowed during shutdown before giving up
    pub shutdown_retries: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: 30,
            flush_batch_size: 64,
            shutdown_retries: 3,
        }
    }
}
