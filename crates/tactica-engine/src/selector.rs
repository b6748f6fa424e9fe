//! Arm selection (tactics)
//!
//! Builds a candidate subset for a request, scores each candidate through
//! its bandit head, picks a winner, and later pairs the observed reward
//! back to the exact feature vector used at selection time.
//!
//! All randomness is seeded from a stable hash of the request context, so
//! an identical request against an unchanged registry reproduces both the
//! exploration sample and the Thompson draws. Ties break toward the
//! lexicographically smallest arm id.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, instrument, warn};

use tactica_common::{Episode, NumericError, SelectionError};

use crate::config::EngineConfig;
use crate::encode::{context_seed, Context, FeatureEncoder};
use crate::episodic::EpisodicIndex;
use crate::persist::PersistenceFlusher;
use crate::registry::{Arm, ArmRegistry};

/// Outcome of one selection
#[derive(Debug)]
pub struct SelectionResult {
    /// The winning arm
    pub arm: Arc<Arm>,
    /// Thompson-sampled score per scored candidate
    pub scores: BTreeMap<String, f64>,
    /// True when no candidate scored and the safe fallback was substituted
    pub cold_start: bool,
}

/// Contextual-bandit selector over the arm registry
pub struct Selector {
    registry: Arc<ArmRegistry>,
    episodic: Arc<EpisodicIndex>,
    flusher: Arc<PersistenceFlusher>,
    encoder: FeatureEncoder,
    /// Open episode per arm, consumed by `update`
    pending: DashMap<String, Episode>,
    forgetting: f64,
    success_threshold: f64,
    warm_start_k: usize,
    exploration_sample: usize,
}

impl Selector {
    pub fn new(
        registry: Arc<ArmRegistry>,
        episodic: Arc<EpisodicIndex>,
        flusher: Arc<PersistenceFlusher>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            episodic,
            flusher,
            encoder: FeatureEncoder::new(config.feature_dim),
            pending: DashMap::new(),
            forgetting: config.forgetting,
            success_threshold: config.success_threshold,
            warm_start_k: config.selection.warm_start_k,
            exploration_sample: config.selection.exploration_sample,
        }
    }

    pub fn encoder(&self) -> &FeatureEncoder {
        &self.encoder
    }

    /// Select an arm for a request.
    ///
    /// An unknown mode is an error the caller handles (typically by falling
    /// back to another mode); an exhausted candidate set within a known mode
    /// degrades to the safe fallback with a zero score instead.
    #[instrument(skip(self, context, candidate_ids), fields(mode = mode))]
    pub fn select(
        &self,
        mode: &str,
        context: &Context,
        candidate_ids: Option<&[String]>,
    ) -> Result<SelectionResult, SelectionError> {
        let x = self.encoder.encode(context);
        let mut rng = StdRng::seed_from_u64(context_seed(mode, context));

        let pool = self.registry.arms_for_mode(mode);
        if pool.is_empty() {
            return Err(SelectionError::UnknownMode(mode.to_string()));
        }
        let pool: Vec<Arc<Arm>> = pool.into_iter().filter(|a| !a.is_quarantined()).collect();

        let candidates = self.build_candidates(&pool, &x, candidate_ids, &mut rng);

        let mut scores = BTreeMap::new();
        for arm in &candidates {
            let sampled = arm.with_head(|head| head.score(&x, &mut rng));
            match sampled {
                Ok(score) if score.is_finite() => {
                    scores.insert(arm.id.clone(), score);
                }
                Ok(score) => {
                    debug!(arm_id = %arm.id, score, "dropping non-finite score");
                }
                Err(NumericError::CholeskyFailed { attempts }) => {
                    warn!(arm_id = %arm.id, attempts, "head factorization failed; quarantining arm");
                    arm.quarantine();
                }
                Err(e) => {
                    warn!(arm_id = %arm.id, error = %e, "score failed; skipping arm");
                }
            }
        }

        let winner = scores
            .iter()
            .max_by(|(id_a, s_a), (id_b, s_b)| {
                s_a.partial_cmp(s_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // BTreeMap iterates ids ascending; on a tie keep the
                    // earlier (smaller) id by treating it as greater
                    .then_with(|| id_b.cmp(id_a))
            })
            .map(|(id, _)| id.clone());

        let (arm, cold_start) = match winner {
            Some(id) => {
                let arm = candidates
                    .iter()
                    .find(|a| a.id == id)
                    .cloned()
                    .ok_or_else(|| SelectionError::UnknownMode(mode.to_string()))?;
                (arm, false)
            }
            None => {
                // extreme cold start: nothing scored, fall back safely
                let arm = self.registry.safe_fallback(Some(mode))?;
                scores.insert(arm.id.clone(), 0.0);
                (arm, true)
            }
        };

        self.pending.insert(
            arm.id.clone(),
            Episode::new(x, arm.id.clone(), scores.clone()),
        );
        debug!(arm_id = %arm.id, candidates = scores.len(), cold_start, "arm selected");
        Ok(SelectionResult {
            arm,
            scores,
            cold_start,
        })
    }

    /// Candidate set: explicit ids restricted to the mode when any survive,
    /// otherwise warm-start suggestions plus a seeded exploration sample.
    fn build_candidates(
        &self,
        pool: &[Arc<Arm>],
        x: &[f64],
        candidate_ids: Option<&[String]>,
        rng: &mut StdRng,
    ) -> Vec<Arc<Arm>> {
        if let Some(ids) = candidate_ids {
            let mut explicit: Vec<Arc<Arm>> = pool
                .iter()
                .filter(|a| ids.contains(&a.id))
                .cloned()
                .collect();
            if !explicit.is_empty() {
                explicit.sort_by(|a, b| a.id.cmp(&b.id));
                return explicit;
            }
        }

        let mut candidates: Vec<Arc<Arm>> = Vec::new();
        for suggested in self.episodic.suggest(x, self.warm_start_k) {
            if let Some(arm) = pool.iter().find(|a| a.id == suggested) {
                if !candidates.iter().any(|c| c.id == arm.id) {
                    candidates.push(arm.clone());
                }
            }
        }

        // pool is id-ordered, so the seeded sample is reproducible
        let remaining: Vec<&Arc<Arm>> = pool
            .iter()
            .filter(|a| !candidates.iter().any(|c| c.id == a.id))
            .collect();
        for arm in remaining.choose_multiple(rng, self.exploration_sample) {
            candidates.push((*arm).clone());
        }

        if candidates.is_empty() {
            candidates = pool.to_vec();
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates
    }

    /// Pair an observed reward back to the arm's open episode.
    ///
    /// A missing episode is a caller protocol violation, logged and dropped
    /// (selection and update pair 1:1 per episode). Returns the consumed
    /// episode when the update was applied.
    #[instrument(skip(self))]
    pub fn update(&self, arm_id: &str, reward: f64) -> Option<Episode> {
        let Some((_, episode)) = self.pending.remove(arm_id) else {
            warn!(arm_id, "update without an open episode; dropping");
            return None;
        };
        let Some(arm) = self.registry.get_arm(arm_id) else {
            warn!(arm_id, "update for an arm no longer registered; dropping");
            return None;
        };

        arm.with_head(|head| head.update(&episode.feature_vector, reward, self.forgetting));
        if reward > self.success_threshold {
            self.episodic
                .insert(episode.feature_vector.clone(), arm_id, reward);
        }
        self.flusher.mark_dirty(arm_id);
        Some(episode)
    }

    /// Move an open episode from one arm to another.
    ///
    /// Used when the safety gate substitutes the fallback arm after
    /// selection: the later `update` must pair with the arm that actually
    /// ran.
    pub fn reassign_pending(&self, from: &str, to: &str) {
        if let Some((_, mut episode)) = self.pending.remove(from) {
            episode.chosen_arm_id = to.to_string();
            self.pending.insert(to.to_string(), episode);
        }
    }

    /// Number of selections still waiting for their outcome
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
