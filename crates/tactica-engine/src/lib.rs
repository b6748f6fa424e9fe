//! # Tactica Engine
//!
//! The request-path core of the Tactica decision engine: a contextual-bandit
//! selector over a dynamic population of policy arms, with a static safety
//! gate, multi-dimensional reward scalarization, distribution-shift
//! detection and dirty-tracked persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      DecisionService                       │
//! │  ┌───────────┐  ┌────────────┐  ┌──────────────────────┐   │
//! │  │  select   │  │   report   │  │  background loops    │   │
//! │  │           │  │   outcome  │  │  (flush / ood)       │   │
//! │  └─────┬─────┘  └─────┬──────┘  └──────────┬───────────┘   │
//! │        │              │                    │               │
//! │  ┌─────┴──────────────┴────────────────────┴───────────┐   │
//! │  │  Encoder → Selector → SafetyGate → RewardArbiter    │   │
//! │  │      (reads ArmRegistry + EpisodicIndex)            │   │
//! │  └──────────────────────┬──────────────────────────────┘   │
//! │                         │                                  │
//! │  ┌──────────────────────┴──────────────────────────────┐   │
//! │  │  ArmRegistry (arms + bandit heads, cold-start safe) │   │
//! │  │  PersistenceFlusher → ArmStore (dirty-tracked)      │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Selection is deterministic per request context: all randomness (Thompson
//! draws and exploration sampling) is seeded from a stable hash of the
//! context, so replaying a request against an unchanged registry reproduces
//! the decision.

pub mod bandit;
pub mod config;
pub mod encode;
pub mod episodic;
pub mod firewall;
pub mod ood;
pub mod persist;
pub mod registry;
pub mod reward;
pub mod selector;
pub mod service;

// Re-export core types
pub use bandit::{BanditHead, BanditHeadState};
pub use config::EngineConfig;
pub use encode::{context_seed, Context, FeatureEncoder};
pub use episodic::EpisodicIndex;
pub use firewall::{EffectPolicy, SafetyGate};
pub use ood::{OodDetector, ShiftReport};
pub use persist::{ArmRecord, ArmStateRecord, ArmStore, InMemoryArmStore, PersistenceFlusher};
pub use registry::{Arm, ArmOrigin, ArmRegistry, ArmStats, RegistryStats};
pub use reward::{RewardArbiter, RewardWeights};
pub use selector::{SelectionResult, Selector};
pub use service::{DecisionService, OutcomeObserver, OutcomeReport, SelectionOutcome};

/// Default feature vector dimensionality (includes the bias coordinate)
pub const DEFAULT_FEATURE_DIM: usize = 64;

/// Default ridge prior strength for fresh bandit heads
pub const DEFAULT_LAMBDA: f64 = 1.0;

/// Default exponential forgetting factor for bandit updates
pub const DEFAULT_FORGETTING: f64 = 0.995;

/// Rewards above this threshold feed the episodic warm-start index
pub const DEFAULT_SUCCESS_THRESHOLD: f64 = 0.5;

/// Default Mahalanobis distance beyond which a context is flagged OOD
pub const DEFAULT_OOD_THRESHOLD: f64 = 2.5;

/// Minimum observed samples before the OOD detector reports at all
pub const DEFAULT_OOD_MIN_SAMPLES: usize = 100;
