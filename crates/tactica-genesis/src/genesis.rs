//! Genesis cycle
//!
//! The background evolution loop over the arm population. Each cycle prunes
//! low-ROI and quarantined arms, rebalances niche shares, allocates the mint
//! budget, and mints gate-validated mutants of niche champions.
//!
//! The cycle is maintenance, not request path: any failing step logs and
//! ends the cycle early, and the next tick starts fresh. The registry's
//! cold-start invariant is never at risk because the last gate-passing arm
//! of a mode is exempt from pruning.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tactica_common::{Niche, PolicyGraph};
use tactica_engine::firewall::SafetyGate;
use tactica_engine::persist::{ArmRecord, ArmStore};
use tactica_engine::registry::{Arm, ArmOrigin, ArmRegistry};
use tactica_engine::service::{OutcomeObserver, OutcomeReport};

use crate::archive::QdArchive;
use crate::mutation::mutate_graph;
use crate::replicator::Replicator;
use crate::GenesisConfig;

/// Where in the cycle the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenesisPhase {
    Idle,
    Pruning,
    Rebalancing,
    Allocating,
    Mutating,
    Minting,
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub pruned: usize,
    pub minted: usize,
    pub discarded_unsafe: usize,
}

/// Population evolution driver
pub struct Genesis {
    registry: Arc<ArmRegistry>,
    archive: Arc<QdArchive>,
    replicator: Mutex<Replicator>,
    gate: Arc<SafetyGate>,
    store: Arc<dyn ArmStore>,
    config: GenesisConfig,
    rng: Mutex<StdRng>,
    phase: Mutex<GenesisPhase>,
}

impl Genesis {
    pub fn new(
        registry: Arc<ArmRegistry>,
        gate: Arc<SafetyGate>,
        store: Arc<dyn ArmStore>,
        config: GenesisConfig,
    ) -> Self {
        let archive = Arc::new(QdArchive::new(config.hysteresis_epsilon));
        let replicator = Mutex::new(Replicator::new(config.eta));
        Self {
            registry,
            archive,
            replicator,
            gate,
            store,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            phase: Mutex::new(GenesisPhase::Idle),
        }
    }

    /// Shared handle to the archive (diagnostics, tests)
    pub fn archive(&self) -> Arc<QdArchive> {
        self.archive.clone()
    }

    pub fn phase(&self) -> GenesisPhase {
        *self.phase.lock()
    }

    /// Reseed the mutation RNG (deterministic cycles in tests)
    pub fn reseed(&self, seed: u64) {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
    }

    fn set_phase(&self, phase: GenesisPhase) {
        *self.phase.lock() = phase;
    }

    /// Run one full evolution cycle.
    ///
    /// Infallible by construction: store failures are logged and the
    /// in-memory population stays authoritative.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        self.set_phase(GenesisPhase::Pruning);
        summary.pruned = self.prune().await;
        self.archive
            .retain_champions(|id| self.registry.get_arm(id).is_some());

        self.set_phase(GenesisPhase::Rebalancing);
        self.replicator.lock().rebalance_shares();

        self.set_phase(GenesisPhase::Allocating);
        let allocation = self.replicator.lock().allocate(self.config.total_budget);

        self.set_phase(GenesisPhase::Mutating);
        let (minted, discarded) = self.mint(allocation).await;
        summary.minted = minted;
        summary.discarded_unsafe = discarded;

        self.set_phase(GenesisPhase::Idle);
        info!(
            pruned = summary.pruned,
            minted = summary.minted,
            discarded_unsafe = summary.discarded_unsafe,
            "genesis cycle complete"
        );
        summary
    }

    /// Remove quarantined arms plus the bottom `prune_fraction` of eligible
    /// arms by reward-per-cost. The last gate-passing arm of any mode is
    /// never a victim.
    async fn prune(&self) -> usize {
        let mut victims: Vec<String> = Vec::new();
        let mut safe_counts: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        let mut eligible: Vec<(String, String, f64)> = Vec::new();

        for mode in self.registry.list_modes() {
            safe_counts.insert(mode.clone(), self.registry.safe_arm_count(&mode));
            for arm in self.registry.arms_for_mode(&mode) {
                if arm.is_quarantined() {
                    victims.push(arm.id.clone());
                    continue;
                }
                let stats = arm.stats();
                if stats.pulls >= self.config.min_trials {
                    eligible.push((arm.id.clone(), mode.clone(), stats.reward_per_cost()));
                }
            }
        }

        if eligible.len() >= self.config.min_population {
            eligible.sort_by(|a, b| {
                a.2.partial_cmp(&b.2)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            let quota = (self.config.prune_fraction * eligible.len() as f64).floor() as usize;
            let mut taken = 0usize;
            for (id, mode, roi) in &eligible {
                if taken >= quota {
                    break;
                }
                let remaining = safe_counts.entry(mode.clone()).or_insert(0);
                if *remaining <= 1 {
                    continue;
                }
                *remaining -= 1;
                debug!(arm_id = %id, roi, "pruning low-ROI arm");
                victims.push(id.clone());
                taken += 1;
            }
        }

        if victims.is_empty() {
            return 0;
        }

        let removed = self.registry.remove_arms(&victims);
        let removed_ids: Vec<String> = removed.iter().map(|a| a.id.clone()).collect();
        if let Err(e) = self.store.delete_arms(removed_ids).await {
            warn!(error = %e, "store delete failed; pruned arms linger until next load");
        }
        removed.len()
    }

    /// Mint mutants of each allocated niche's champion. Variants that fail
    /// the safety gate are discarded and counted, never registered.
    async fn mint(
        &self,
        allocation: std::collections::BTreeMap<Niche, usize>,
    ) -> (usize, usize) {
        let mut records: Vec<ArmRecord> = Vec::new();
        let mut minted: Vec<Arc<Arm>> = Vec::new();
        let mut discarded = 0usize;

        for (niche, slots) in allocation {
            let parent = self
                .archive
                .champion_of(&niche)
                .and_then(|id| self.registry.get_arm(&id));
            let template = match &parent {
                Some(arm) => arm.graph.clone(),
                // niche outlived its champion; restart it from the safe shape
                None => PolicyGraph::noop(format!("seed-{}", niche.task_family)),
            };
            let mode = niche.task_family.clone();

            for _ in 0..slots {
                let child = {
                    let mut rng = self.rng.lock();
                    mutate_graph(
                        &template,
                        self.config.jitter_std,
                        self.config.param_min,
                        self.config.param_max,
                        &mut *rng,
                    )
                };
                if let Err(e) = self.gate.validate(&child) {
                    warn!(%niche, error = %e, "discarding unsafe mutant");
                    discarded += 1;
                    continue;
                }
                let graph_json = match child.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%niche, error = %e, "discarding unserializable mutant");
                        discarded += 1;
                        continue;
                    }
                };
                let id = format!("genesis-{}-{}", mode, Uuid::now_v7());
                let arm = self
                    .registry
                    .add_arm(id.clone(), child, mode.clone(), ArmOrigin::Genesis);
                records.push(ArmRecord {
                    id,
                    graph_json,
                    mode: mode.clone(),
                    head: None,
                });
                minted.push(arm);
            }
        }

        self.set_phase(GenesisPhase::Minting);
        if !records.is_empty() {
            if let Err(e) = self.store.insert_arms(records).await {
                warn!(error = %e, "store insert failed; minted arms live in memory only");
            }
        }
        (minted.len(), discarded)
    }

    /// Periodic cycle loop with cooperative cancellation
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.cycle_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // skip the immediate first tick; the population needs evidence first
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("genesis loop stopped");
                        return;
                    }
                }
            }
        }
    }
}

impl OutcomeObserver for Genesis {
    fn on_outcome(&self, report: &OutcomeReport) {
        self.archive
            .insert(report.niche.clone(), &report.arm_id, report.scalar_reward);
        self.replicator
            .lock()
            .update_fitness(&report.niche, report.scalar_reward);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tactica_common::{Effect, NodeKind, OutcomeVector, PolicyNode};
    use tactica_engine::persist::InMemoryArmStore;

    fn config() -> GenesisConfig {
        GenesisConfig {
            total_budget: 2,
            min_trials: 1,
            min_population: 2,
            prune_fraction: 0.5,
            cycle_interval_secs: 1,
            ..GenesisConfig::default()
        }
    }

    fn setup(config: GenesisConfig) -> (Arc<ArmRegistry>, Arc<InMemoryArmStore>, Genesis) {
        let gate = Arc::new(SafetyGate::default());
        let registry = Arc::new(ArmRegistry::new(gate.clone(), 8, 1.0));
        let store = Arc::new(InMemoryArmStore::new());
        let genesis = Genesis::new(registry.clone(), gate, store.clone(), config);
        genesis.reseed(11);
        (registry, store, genesis)
    }

    fn report(arm_id: &str, mode: &str, reward: f64) -> OutcomeReport {
        OutcomeReport {
            arm_id: arm_id.to_string(),
            mode: mode.to_string(),
            niche: Niche::new(mode, "low", "low"),
            outcome: OutcomeVector::new(reward, 0.1, 0.1, 0.0),
            scalar_reward: reward,
        }
    }

    #[tokio::test]
    async fn test_cycle_on_empty_registry_is_noop() {
        let (_registry, store, genesis) = setup(config());
        let summary = genesis.run_cycle().await;

        assert_eq!(summary.pruned, 0);
        assert_eq!(summary.minted, 0);
        assert!(store.is_empty());
        assert_eq!(genesis.phase(), GenesisPhase::Idle);
    }

    #[tokio::test]
    async fn test_prune_removes_worst_roi() {
        let (registry, store, genesis) = setup(config());
        let good = registry.add_arm("good", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        let bad = registry.add_arm("bad", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        good.record_outcome(0.9, 0.1);
        bad.record_outcome(0.1, 0.9);
        store
            .insert_arms(vec![ArmRecord {
                id: "bad".into(),
                graph_json: PolicyGraph::noop("n").to_json().unwrap(),
                mode: "m".into(),
                head: None,
            }])
            .await
            .unwrap();

        let summary = genesis.run_cycle().await;

        assert_eq!(summary.pruned, 1);
        assert!(registry.get_arm("good").is_some());
        assert!(registry.get_arm("bad").is_none());
        assert!(store.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_prune_skipped_below_min_population() {
        let mut cfg = config();
        cfg.min_population = 10;
        let (registry, _store, genesis) = setup(cfg);
        let a = registry.add_arm("a", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        let b = registry.add_arm("b", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        a.record_outcome(0.1, 0.9);
        b.record_outcome(0.9, 0.1);

        let summary = genesis.run_cycle().await;
        assert_eq!(summary.pruned, 0);
        assert_eq!(registry.arms_for_mode("m").len(), 2);
    }

    #[tokio::test]
    async fn test_never_prunes_last_safe_arm_of_mode() {
        let (registry, _store, genesis) = setup(config());
        // both eligible, but each is the last safe arm of its own mode
        let a = registry.add_arm("a", PolicyGraph::noop("n"), "alpha", ArmOrigin::Bootstrap);
        let b = registry.add_arm("b", PolicyGraph::noop("n"), "beta", ArmOrigin::Bootstrap);
        a.record_outcome(0.1, 0.9);
        b.record_outcome(0.1, 0.9);

        let summary = genesis.run_cycle().await;
        assert_eq!(summary.pruned, 0);
        assert!(registry.get_arm("a").is_some());
        assert!(registry.get_arm("b").is_some());
    }

    #[tokio::test]
    async fn test_quarantined_arm_always_pruned() {
        let mut cfg = config();
        cfg.min_population = 100; // ROI pruning disabled for this test
        let (registry, _store, genesis) = setup(cfg);
        registry.add_arm("ok", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        let sick = registry.add_arm("sick", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        sick.quarantine();

        let summary = genesis.run_cycle().await;
        assert_eq!(summary.pruned, 1);
        assert!(registry.get_arm("sick").is_none());
        assert!(registry.get_arm("ok").is_some());
    }

    #[tokio::test]
    async fn test_mint_from_champion_respects_budget_and_bounds() {
        let (registry, store, genesis) = setup(config());
        let graph = PolicyGraph::new().with_node(
            PolicyNode::new("gen", NodeKind::Prompt).with_param("temperature", 0.7),
        );
        registry.add_arm("champ", graph, "m", ArmOrigin::Bootstrap);
        genesis.on_outcome(&report("champ", "m", 0.8));

        let summary = genesis.run_cycle().await;

        assert!(summary.minted >= 1 && summary.minted <= 2);
        let genesis_arms: Vec<_> = registry
            .arms_for_mode("m")
            .into_iter()
            .filter(|a| a.origin == ArmOrigin::Genesis)
            .collect();
        assert_eq!(genesis_arms.len(), summary.minted);
        for arm in &genesis_arms {
            let temp = arm.graph.node("gen").unwrap().params["temperature"];
            assert!((0.0..=2.0).contains(&temp));
            assert!(store.get(&arm.id).is_some());
        }
    }

    #[tokio::test]
    async fn test_unsafe_mutant_discarded_not_minted() {
        let (registry, _store, genesis) = setup(config());
        let risky = PolicyGraph::new().with_node(
            PolicyNode::new("sync", NodeKind::Tool)
                .with_effect(Effect::Write)
                .with_effect(Effect::NetAccess),
        );
        registry.add_arm("champ", risky, "m", ArmOrigin::Bootstrap);
        genesis.on_outcome(&report("champ", "m", 0.8));

        let summary = genesis.run_cycle().await;

        assert_eq!(summary.minted, 0);
        assert!(summary.discarded_unsafe >= 1);
        assert!(registry
            .arms_for_mode("m")
            .iter()
            .all(|a| a.origin != ArmOrigin::Genesis));
    }

    #[tokio::test]
    async fn test_orphaned_niche_reseeds_from_noop() {
        let (registry, _store, genesis) = setup(config());
        // fitness recorded against an arm that no longer exists
        genesis.on_outcome(&report("gone", "m", 0.6));

        let summary = genesis.run_cycle().await;

        // champion cleanup emptied the archive, but the replicator still
        // allocates the niche, so the cycle reseeds it from the safe shape
        assert!(summary.minted >= 1);
        for arm in registry.arms_for_mode("m") {
            assert!(arm.graph.is_effect_free());
        }
    }

    #[tokio::test]
    async fn test_observer_feeds_archive_and_replicator() {
        let (_registry, _store, genesis) = setup(config());
        genesis.on_outcome(&report("arm-1", "m", 0.7));

        let niche = Niche::new("m", "low", "low");
        assert_eq!(
            genesis.archive().champion_of(&niche),
            Some("arm-1".to_string())
        );
        assert!((genesis.replicator.lock().fitness_of(&niche).unwrap() - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_minted_arms_in_memory() {
        let (registry, store, genesis) = setup(config());
        registry.add_arm("champ", PolicyGraph::noop("n"), "m", ArmOrigin::Bootstrap);
        genesis.on_outcome(&report("champ", "m", 0.8));
        store.set_failing(true);

        let summary = genesis.run_cycle().await;

        assert!(summary.minted >= 1);
        let in_memory = registry
            .arms_for_mode("m")
            .iter()
            .filter(|a| a.origin == ArmOrigin::Genesis)
            .count();
        assert_eq!(in_memory, summary.minted);
    }
}
