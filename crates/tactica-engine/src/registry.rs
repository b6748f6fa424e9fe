//! Arm registry
//!
//! Exclusive owner of the arm population and its learned value models.
//! Other components reference arms by id and go through this API for every
//! mutation; the only direct mutators elsewhere are `BanditHead::update`
//! (called through the arm's head lock by the selector) and the outcome
//! counters on `ArmStats`.
//!
//! ## Invariant
//!
//! For every mode present in the registry, at least one arm whose graph
//! passes the safety gate exists at all times. `ensure_cold_start` repairs
//! any violation by seeding a minimal no-op arm, and `safe_fallback` is the
//! only operation allowed to be fatal (when even repair cannot help).
//!
//! ## Concurrency
//!
//! One reader-writer lock covers the arm map and the mode index; selection
//! reads share it, Genesis mint/prune and initialize take it exclusively.
//! Arms are handed out as `Arc<Arm>`, so an arm removed mid-scoring stays
//! alive until the last in-flight reference drops.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use tactica_common::{PolicyGraph, SelectionError};

use crate::bandit::{BanditHead, BanditHeadState};
use crate::firewall::SafetyGate;
use crate::persist::ArmStore;

/// How an arm entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOrigin {
    /// Loaded from durable storage at startup
    Restored,
    /// Seeded by cold-start repair
    ColdStart,
    /// Minted by the Genesis loop
    Genesis,
    /// Registered directly by an operator or bootstrap script
    Bootstrap,
}

/// Mutable outcome counters for pruning and diagnostics
#[derive(Debug, Clone, Default)]
pub struct ArmStats {
    pub pulls: u64,
    pub reward_sum: f64,
    pub cost_sum: f64,
    pub last_selected: Option<DateTime<Utc>>,
}

impl ArmStats {
    /// Reward earned per unit of cost; the pruning fitness signal
    pub fn reward_per_cost(&self) -> f64 {
        if self.cost_sum <= f64::EPSILON {
            return self.reward_sum;
        }
        self.reward_sum / self.cost_sum
    }
}

/// A selectable policy: immutable identity plus mutable learned state
pub struct Arm {
    pub id: String,
    pub graph: PolicyGraph,
    pub mode: String,
    pub origin: ArmOrigin,
    pub created_at: DateTime<Utc>,
    head: Mutex<BanditHead>,
    stats: Mutex<ArmStats>,
    quarantined: AtomicBool,
}

impl Arm {
    fn new(
        id: String,
        graph: PolicyGraph,
        mode: String,
        origin: ArmOrigin,
        head: BanditHead,
    ) -> Self {
        Self {
            id,
            graph,
            mode,
            origin,
            created_at: Utc::now(),
            head: Mutex::new(head),
            stats: Mutex::new(ArmStats::default()),
            quarantined: AtomicBool::new(false),
        }
    }

    /// Run `f` under this arm's head lock.
    ///
    /// Updates for the same arm serialize here; cross-arm updates proceed in
    /// parallel.
    pub fn with_head<T>(&self, f: impl FnOnce(&mut BanditHead) -> T) -> T {
        let mut head = self.head.lock();
        f(&mut head)
    }

    /// Snapshot the head's sufficient statistics
    pub fn head_state(&self) -> BanditHeadState {
        self.head.lock().snapshot()
    }

    /// Record a finished episode's reward and cost
    pub fn record_outcome(&self, reward: f64, cost: f64) {
        let mut stats = self.stats.lock();
        stats.pulls += 1;
        stats.reward_sum += reward;
        stats.cost_sum += cost;
        stats.last_selected = Some(Utc::now());
    }

    /// Copy of the outcome counters
    pub fn stats(&self) -> ArmStats {
        self.stats.lock().clone()
    }

    /// Exclude this arm from selection (numeric failure of its head)
    pub fn quarantine(&self) {
        self.quarantined.store(true, Ordering::SeqCst);
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arm")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("origin", &self.origin)
            .field("quarantined", &self.is_quarantined())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    arms: HashMap<String, Arc<Arm>>,
    /// Mode -> arm ids, ordered so per-mode listings are deterministic
    by_mode: HashMap<String, BTreeSet<String>>,
}

/// Summary counters in the style of a store stats snapshot
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_arms: usize,
    pub modes: usize,
    pub quarantined: usize,
    pub gate_passing: usize,
}

/// Owner of all arms and their bandit heads
pub struct ArmRegistry {
    inner: RwLock<RegistryInner>,
    gate: Arc<SafetyGate>,
    feature_dim: usize,
    lambda: f64,
}

impl ArmRegistry {
    pub fn new(gate: Arc<SafetyGate>, feature_dim: usize, lambda: f64) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            gate,
            feature_dim,
            lambda,
        }
    }

    /// Bulk-load all arms from durable storage, then run cold-start repair.
    ///
    /// Never fails: a load error leaves an empty registry, and repair still
    /// runs so the safe-fallback invariant holds from the first request.
    pub async fn initialize(&self, store: &dyn ArmStore) {
        let records = match store.load_all_arms().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "arm load failed; starting from an empty registry");
                Vec::new()
            }
        };

        let mut loaded = 0usize;
        for record in records {
            let graph = match PolicyGraph::from_json(&record.graph_json) {
                Ok(graph) => graph,
                Err(e) => {
                    warn!(arm_id = %record.id, error = %e, "skipping arm with unreadable graph");
                    continue;
                }
            };
            let head = match record.head.map(BanditHead::restore) {
                Some(Ok(head)) if head.dim() == self.feature_dim => head,
                Some(Ok(_)) | None => BanditHead::new(self.feature_dim, self.lambda),
                Some(Err(e)) => {
                    warn!(arm_id = %record.id, error = %e, "corrupt head state; reinitializing");
                    BanditHead::new(self.feature_dim, self.lambda)
                }
            };
            self.insert(Arc::new(Arm::new(
                record.id,
                graph,
                record.mode,
                ArmOrigin::Restored,
                head,
            )));
            loaded += 1;
        }

        self.ensure_cold_start();
        info!(loaded, "arm registry initialized");
    }

    /// Insert a new arm with a fresh, evidence-free head.
    ///
    /// Id collision is a programming error, not a runtime condition.
    pub fn add_arm(
        &self,
        id: impl Into<String>,
        graph: PolicyGraph,
        mode: impl Into<String>,
        origin: ArmOrigin,
    ) -> Arc<Arm> {
        let id = id.into();
        let mode = mode.into();
        let head = BanditHead::new(self.feature_dim, self.lambda);
        let arm = Arc::new(Arm::new(id.clone(), graph, mode, origin, head));
        assert!(
            self.insert(arm.clone()),
            "duplicate arm id registered: {id}"
        );
        arm
    }

    fn insert(&self, arm: Arc<Arm>) -> bool {
        let mut inner = self.inner.write();
        if inner.arms.contains_key(&arm.id) {
            return false;
        }
        inner
            .by_mode
            .entry(arm.mode.clone())
            .or_default()
            .insert(arm.id.clone());
        inner.arms.insert(arm.id.clone(), arm);
        true
    }

    /// Remove arms by id, returning the removed handles so the caller can
    /// schedule best-effort store deletion. In-flight scoring against a
    /// removed arm finishes on its own `Arc`.
    pub fn remove_arms(&self, ids: &[String]) -> Vec<Arc<Arm>> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for id in ids {
            if let Some(arm) = inner.arms.remove(id) {
                if let Some(mode_set) = inner.by_mode.get_mut(&arm.mode) {
                    mode_set.remove(id);
                    if mode_set.is_empty() {
                        inner.by_mode.remove(&arm.mode);
                    }
                }
                removed.push(arm);
            }
        }
        removed
    }

    pub fn get_arm(&self, id: &str) -> Option<Arc<Arm>> {
        self.inner.read().arms.get(id).cloned()
    }

    /// All arms of a mode, ordered by id
    pub fn arms_for_mode(&self, mode: &str) -> Vec<Arc<Arm>> {
        let inner = self.inner.read();
        inner
            .by_mode
            .get(mode)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.arms.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_modes(&self) -> Vec<String> {
        let mut modes: Vec<String> = self.inner.read().by_mode.keys().cloned().collect();
        modes.sort();
        modes
    }

    /// Whether an arm's graph passes the safety gate under the current table
    pub fn passes_gate(&self, arm: &Arm) -> bool {
        self.gate.validate(&arm.graph).is_ok() && !arm.is_quarantined()
    }

    /// Gate-passing arms within a mode
    pub fn safe_arm_count(&self, mode: &str) -> usize {
        self.arms_for_mode(mode)
            .iter()
            .filter(|a| self.passes_gate(a))
            .count()
    }

    /// Return a gate-passing arm, preferring the requested mode.
    ///
    /// Runs cold-start repair and retries once before giving up. This is
    /// the only registry operation allowed to be fatal; a failure here means
    /// the invariant is unrepairable.
    pub fn safe_fallback(&self, mode: Option<&str>) -> Result<Arc<Arm>, SelectionError> {
        if let Some(arm) = self.find_safe(mode) {
            return Ok(arm);
        }

        match mode {
            Some(m) => self.ensure_mode(m),
            None => self.ensure_cold_start(),
        }

        self.find_safe(mode)
            .ok_or_else(|| SelectionError::FallbackUnavailable {
                mode: mode.unwrap_or("<any>").to_string(),
            })
    }

    fn find_safe(&self, mode: Option<&str>) -> Option<Arc<Arm>> {
        let pick = |arms: Vec<Arc<Arm>>| arms.into_iter().find(|a| self.passes_gate(a));

        if let Some(m) = mode {
            if let Some(arm) = pick(self.arms_for_mode(m)) {
                return Some(arm);
            }
        }
        for m in self.list_modes() {
            if let Some(arm) = pick(self.arms_for_mode(&m)) {
                return Some(arm);
            }
        }
        None
    }

    /// Idempotent cold-start repair over every known mode
    pub fn ensure_cold_start(&self) {
        for mode in self.list_modes() {
            self.ensure_mode(&mode);
        }
    }

    /// Guarantee the given mode exists and carries a gate-passing arm.
    ///
    /// Synthesizes a minimal no-op arm under a fresh id when needed. Called
    /// from every code path that can observe an empty mode.
    pub fn ensure_mode(&self, mode: &str) {
        if self.safe_arm_count(mode) > 0 {
            return;
        }
        let id = format!("fallback-{}-{}", mode, Uuid::now_v7());
        info!(mode, arm_id = %id, "cold-start repair: seeding no-op fallback arm");
        self.add_arm(
            id,
            PolicyGraph::noop(format!("noop-{mode}")),
            mode,
            ArmOrigin::ColdStart,
        );
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.read();
        let quarantined = inner.arms.values().filter(|a| a.is_quarantined()).count();
        let gate_passing = inner
            .arms
            .values()
            .filter(|a| self.gate.validate(&a.graph).is_ok())
            .count();
        RegistryStats {
            total_arms: inner.arms.len(),
            modes: inner.by_mode.len(),
            quarantined,
            gate_passing,
        }
    }
}
