//! Decision service facade
//!
//! Constructor-injected wiring of the selection core behind the two-call
//! contract the platform exposes: `select` and `report_outcome`. The
//! service also owns the background lifecycle: the persistence flush loop
//! and the OOD distribution refresh run until `shutdown`, which signals
//! cooperative cancellation and performs a final synchronous drain so no
//! learned state is lost.
//!
//! Recoverable conditions never fail a request: an unknown mode or an
//! exhausted candidate pool degrades to the cold-start fallback, and a
//! safety-gate rejection substitutes the fallback arm. Both are reported as
//! flags on the decision, not as errors.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use tactica_common::{Niche, OutcomeVector, PolicyGraph, Result, SelectionError, TacticaError};

use crate::config::EngineConfig;
use crate::encode::Context;
use crate::episodic::EpisodicIndex;
use crate::firewall::SafetyGate;
use crate::ood::{OodDetector, ShiftReport};
use crate::persist::{ArmStore, PersistenceFlusher};
use crate::registry::ArmRegistry;
use crate::reward::RewardArbiter;
use crate::selector::Selector;

/// A finalized episode as seen by outcome observers
#[derive(Debug, Clone)]
pub struct OutcomeReport {
    pub arm_id: String,
    pub mode: String,
    pub niche: Niche,
    pub outcome: OutcomeVector,
    pub scalar_reward: f64,
}

/// Hook for components that learn from finished episodes (e.g. the
/// Quality-Diversity archive and replicator in the evolution crate)
pub trait OutcomeObserver: Send + Sync {
    fn on_outcome(&self, report: &OutcomeReport);
}

/// Decision returned to the caller
#[derive(Debug)]
pub struct SelectionOutcome {
    pub arm_id: String,
    pub policy_graph: PolicyGraph,
    pub scores: std::collections::BTreeMap<String, f64>,
    /// True when the safe fallback was substituted for lack of evidence
    pub cold_start: bool,
    /// Rejection reason when the safety gate replaced the scored winner
    pub gate_substitution: Option<String>,
    /// Distribution-shift verdict for this context
    pub shift: ShiftReport,
}

/// The orchestration engine's public facade
pub struct DecisionService {
    config: EngineConfig,
    registry: Arc<ArmRegistry>,
    selector: Arc<Selector>,
    gate: Arc<SafetyGate>,
    arbiter: Arc<RewardArbiter>,
    ood: Arc<OodDetector>,
    flusher: Arc<PersistenceFlusher>,
    store: Arc<dyn ArmStore>,
    observers: Mutex<Vec<Arc<dyn OutcomeObserver>>>,
    /// Recent feature vectors feeding the next OOD refresh
    recent: Mutex<VecDeque<Vec<f64>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DecisionService {
    pub fn new(config: EngineConfig, store: Arc<dyn ArmStore>, gate: Arc<SafetyGate>) -> Self {
        let registry = Arc::new(ArmRegistry::new(
            gate.clone(),
            config.feature_dim,
            config.lambda,
        ));
        let episodic = Arc::new(EpisodicIndex::new(config.episodic.capacity));
        let flusher = Arc::new(PersistenceFlusher::new(
            registry.clone(),
            store.clone(),
            config.persistence.flush_batch_size,
            config.persistence.shutdown_retries,
        ));
        let selector = Arc::new(Selector::new(
            registry.clone(),
            episodic,
            flusher.clone(),
            &config,
        ));
        let ood = Arc::new(OodDetector::new(
            config.feature_dim,
            config.ood.threshold,
            config.ood.min_samples,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            registry,
            selector,
            gate,
            arbiter: Arc::new(RewardArbiter::default()),
            ood,
            flusher,
            store,
            observers: Mutex::new(Vec::new()),
            recent: Mutex::new(VecDeque::new()),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load the arm population from durable storage and repair cold start
    pub async fn initialize(&self) {
        self.registry.initialize(self.store.as_ref()).await;
    }

    /// Register a hook invoked for every finalized episode
    pub fn add_observer(&self, observer: Arc<dyn OutcomeObserver>) {
        self.observers.lock().push(observer);
    }

    pub fn registry(&self) -> &Arc<ArmRegistry> {
        &self.registry
    }

    pub fn arbiter(&self) -> &Arc<RewardArbiter> {
        &self.arbiter
    }

    pub fn flusher(&self) -> &Arc<PersistenceFlusher> {
        &self.flusher
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Choose an arm for a request.
    ///
    /// Always returns a runnable arm for recoverable conditions, degrading
    /// quality rather than availability; only an unrepairable registry
    /// invariant surfaces as an error.
    #[instrument(skip(self, context, candidate_ids), fields(mode = mode))]
    pub fn select(
        &self,
        mode: &str,
        context: &Context,
        candidate_ids: Option<&[String]>,
    ) -> Result<SelectionOutcome> {
        let x = self.selector.encoder().encode(context);
        let shift = self.ood.check_shift(&x);
        if shift.is_ood {
            warn!(distance = ?shift.distance, "context flagged as out-of-distribution");
        }
        self.remember_context(x);

        let mut seeded_mode = false;
        let result = match self.selector.select(mode, context, candidate_ids) {
            Ok(result) => result,
            Err(SelectionError::UnknownMode(_)) => {
                // seed the mode and retry once; the fallback arm will score
                self.registry.ensure_mode(mode);
                seeded_mode = true;
                self.selector.select(mode, context, candidate_ids)?
            }
            Err(e) => return Err(TacticaError::Selection(e)),
        };

        // defense in depth: re-validate the winner at selection time
        let (arm, gate_substitution) = match self.gate.validate(&result.arm.graph) {
            Ok(()) => (result.arm, None),
            Err(violation) => {
                let reason = violation.to_string();
                warn!(arm_id = %result.arm.id, %reason, "gate rejected winner; substituting fallback");
                let fallback = self.registry.safe_fallback(Some(mode))?;
                self.selector.reassign_pending(&result.arm.id, &fallback.id);
                (fallback, Some(reason))
            }
        };

        Ok(SelectionOutcome {
            arm_id: arm.id.clone(),
            policy_graph: arm.graph.clone(),
            scores: result.scores,
            cold_start: result.cold_start || seeded_mode,
            gate_substitution,
            shift,
        })
    }

    /// Report the observed outcome of an executed arm; returns the scalar
    /// reward that was applied.
    #[instrument(skip(self, context, outcome))]
    pub fn report_outcome(
        &self,
        arm_id: &str,
        context: &Context,
        outcome: &OutcomeVector,
    ) -> Result<f64> {
        let vector = self.arbiter.compute_vector(outcome);
        let reward = self.arbiter.scalarize(&vector);

        let Some(mut episode) = self.selector.update(arm_id, reward) else {
            // protocol violation already logged by the selector; the reward
            // is still returned so the caller's accounting stays coherent
            return Ok(reward);
        };
        episode.finalize(*outcome, reward);

        let Some(arm) = self.registry.get_arm(arm_id) else {
            return Ok(reward);
        };
        let [_, cost, _, _] = outcome.clipped();
        arm.record_outcome(reward, cost);

        let risk_level = context
            .get("risk_level")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified");
        let report = OutcomeReport {
            arm_id: arm_id.to_string(),
            mode: arm.mode.clone(),
            niche: Niche::describe(&arm.mode, risk_level, cost),
            outcome: *outcome,
            scalar_reward: reward,
        };
        for observer in self.observers.lock().iter() {
            observer.on_outcome(&report);
        }
        tracing::debug!(episode_id = %episode.id, arm_id, reward, "episode finalized");
        Ok(reward)
    }

    /// Refit the OOD distribution from the recent context window now
    pub fn refresh_ood(&self) {
        let window: Vec<Vec<f64>> = self.recent.lock().iter().cloned().collect();
        self.ood.refresh(&window);
    }

    fn remember_context(&self, x: Vec<f64>) {
        let mut recent = self.recent.lock();
        let cap = (self.config.ood.min_samples * 4).max(256);
        if recent.len() >= cap {
            recent.pop_front();
        }
        recent.push_back(x);
    }

    /// Spawn the flush and OOD refresh loops on the current runtime
    pub fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let flusher = self.flusher.clone();
        let interval = Duration::from_secs(self.config.persistence.flush_interval_secs);
        tasks.push(tokio::spawn(
            flusher.run(interval, self.shutdown_rx.clone()),
        ));

        let service = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        let refresh_every = Duration::from_secs(self.config.ood.refresh_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => service.refresh_ood(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Signal cancellation, drain dirty state and wait for background tasks
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        // a final drain also covers the case where no loops were spawned
        self.flusher.drain().await;
        info!("decision service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryArmStore;
    use crate::registry::ArmOrigin;
    use serde_json::json;
    use tactica_common::{Effect, NodeKind, PolicyNode};

    fn ctx(value: serde_json::Value) -> Context {
        value.as_object().unwrap().clone()
    }

    fn service() -> Arc<DecisionService> {
        let config = EngineConfig {
            feature_dim: 8,
            ..EngineConfig::default()
        };
        Arc::new(DecisionService::new(
            config,
            Arc::new(InMemoryArmStore::new()),
            Arc::new(SafetyGate::default()),
        ))
    }

    fn risky_graph() -> PolicyGraph {
        PolicyGraph::new().with_node(
            PolicyNode::new("sync", NodeKind::Tool)
                .with_effect(Effect::Write)
                .with_effect(Effect::NetAccess),
        )
    }

    #[tokio::test]
    async fn test_unknown_mode_degrades_to_cold_start() {
        let svc = service();
        svc.initialize().await;

        let outcome = svc.select("planful", &Context::new(), None).unwrap();
        assert!(outcome.cold_start);
        assert!(outcome.policy_graph.is_effect_free());
        // the seeded mode now exists
        assert_eq!(svc.registry().list_modes(), vec!["planful".to_string()]);
    }

    #[tokio::test]
    async fn test_gate_substitutes_unsafe_winner() {
        let svc = service();
        svc.initialize().await;
        svc.registry()
            .add_arm("risky", risky_graph(), "m", ArmOrigin::Bootstrap);

        // repeated selections never return the unsafe arm
        for i in 0..10 {
            let c = ctx(json!({"task_key": format!("t{i}")}));
            let outcome = svc.select("m", &c, None).unwrap();
            assert_ne!(outcome.arm_id, "risky");
            // pair each selection so the pending cache stays clean
            svc.report_outcome(&outcome.arm_id, &c, &OutcomeVector::new(1.0, 0.1, 0.1, 0.0))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_report_outcome_round_trip() {
        let svc = service();
        svc.initialize().await;
        svc.registry()
            .add_arm("a1", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);

        let c = ctx(json!({"risk_level": "low"}));
        let selection = svc.select("m", &c, None).unwrap();
        let reward = svc
            .report_outcome(&selection.arm_id, &c, &OutcomeVector::new(1.0, 0.1, 0.1, 0.0))
            .unwrap();
        assert!(reward > 0.0 && reward <= 1.0);

        let arm = svc.registry().get_arm(&selection.arm_id).unwrap();
        assert_eq!(arm.stats().pulls, 1);
        assert_eq!(svc.flusher().dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_observers_receive_finalized_episodes() {
        struct Capture(Mutex<Vec<OutcomeReport>>);
        impl OutcomeObserver for Capture {
            fn on_outcome(&self, report: &OutcomeReport) {
                self.0.lock().push(report.clone());
            }
        }

        let svc = service();
        svc.initialize().await;
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        svc.add_observer(capture.clone());

        let c = ctx(json!({"risk_level": "high"}));
        let selection = svc.select("m", &c, None).unwrap();
        svc.report_outcome(&selection.arm_id, &c, &OutcomeVector::new(0.8, 0.5, 0.2, 0.0))
            .unwrap();

        let seen = capture.0.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].niche.risk_tier, "high");
        assert_eq!(seen[0].niche.cost_tier, "mid");
    }

    #[tokio::test]
    async fn test_shutdown_drains_dirty_state() {
        let store = Arc::new(InMemoryArmStore::new());
        let config = EngineConfig {
            feature_dim: 8,
            ..EngineConfig::default()
        };
        let svc = Arc::new(DecisionService::new(
            config,
            store.clone(),
            Arc::new(SafetyGate::default()),
        ));
        svc.initialize().await;
        svc.registry()
            .add_arm("a1", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);

        let c = Context::new();
        let selection = svc.select("m", &c, None).unwrap();
        svc.report_outcome(&selection.arm_id, &c, &OutcomeVector::new(1.0, 0.0, 0.0, 0.0))
            .unwrap();

        svc.shutdown().await;
        assert_eq!(svc.flusher().dirty_count(), 0);
        assert!(store.get(&selection.arm_id).is_some());
    }
}
