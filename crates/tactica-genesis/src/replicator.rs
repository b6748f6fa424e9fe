//! Replicator-dynamics budget allocation
//!
//! Each niche carries a fitness estimate (EMA of scalar rewards) and a
//! population share. Shares evolve by the discrete replicator rule: niches
//! fitter than the population mean grow, the rest shrink, and shares always
//! renormalize to sum to one. The mint budget for a cycle is the shares
//! projected onto an integer arm count.

use std::collections::BTreeMap;

use tracing::debug;

use tactica_common::Niche;

#[derive(Debug, Clone)]
struct NicheState {
    fitness: f64,
    share: f64,
}

/// Per-niche fitness tracking and share dynamics
pub struct Replicator {
    eta: f64,
    niches: BTreeMap<Niche, NicheState>,
}

impl Replicator {
    pub fn new(eta: f64) -> Self {
        Self {
            eta: eta.clamp(1e-6, 1.0),
            niches: BTreeMap::new(),
        }
    }

    /// Fold one episode's scalar reward into the niche's fitness EMA.
    ///
    /// A niche seen for the first time enters at the observed fitness with a
    /// uniform share slice, after which all shares renormalize.
    pub fn update_fitness(&mut self, niche: &Niche, sample: f64) {
        if !sample.is_finite() {
            return;
        }
        match self.niches.get_mut(niche) {
            Some(state) => {
                state.fitness = (1.0 - self.eta) * state.fitness + self.eta * sample;
            }
            None => {
                let share = 1.0 / (self.niches.len() as f64 + 1.0);
                self.niches.insert(
                    niche.clone(),
                    NicheState {
                        fitness: sample,
                        share,
                    },
                );
                self.renormalize();
            }
        }
    }

    /// One replicator step: `share <- share * exp(eta * (fitness - mean))`,
    /// then renormalize so the shares sum to one.
    pub fn rebalance_shares(&mut self) {
        if self.niches.is_empty() {
            return;
        }
        let mean: f64 =
            self.niches.values().map(|s| s.fitness).sum::<f64>() / self.niches.len() as f64;
        for state in self.niches.values_mut() {
            state.share *= (self.eta * (state.fitness - mean)).exp();
        }
        self.renormalize();
        debug!(niches = self.niches.len(), mean_fitness = mean, "shares rebalanced");
    }

    fn renormalize(&mut self) {
        let total: f64 = self.niches.values().map(|s| s.share).sum();
        if total.is_finite() && total > 0.0 {
            for state in self.niches.values_mut() {
                state.share /= total;
            }
        } else {
            // degenerate shares (all collapsed or overflowed): reset uniform
            let uniform = 1.0 / self.niches.len() as f64;
            for state in self.niches.values_mut() {
                state.share = uniform;
            }
        }
    }

    /// Split an integer mint budget across niches by share.
    ///
    /// Every tracked niche gets at least one slot before rounding, then the
    /// largest allocations give slots back greedily until the total fits the
    /// budget. With more niches than budget, the lowest-share niches drop to
    /// zero.
    pub fn allocate(&self, total_budget: usize) -> BTreeMap<Niche, usize> {
        let mut alloc: BTreeMap<Niche, usize> = self
            .niches
            .iter()
            .map(|(n, s)| {
                let slots = (s.share * total_budget as f64).round() as usize;
                (n.clone(), slots.max(1))
            })
            .collect();

        let mut assigned: usize = alloc.values().sum();
        while assigned > total_budget {
            // take a slot from the currently largest allocation; ties break
            // on niche order so the correction is deterministic
            let victim = alloc
                .iter()
                .max_by(|(n_a, c_a), (n_b, c_b)| c_a.cmp(c_b).then_with(|| n_b.cmp(n_a)))
                .map(|(n, _)| n.clone());
            match victim {
                Some(n) => {
                    let slots = alloc.get_mut(&n).map(|c| {
                        *c = c.saturating_sub(1);
                        *c
                    });
                    if slots == Some(0) {
                        alloc.remove(&n);
                    }
                    assigned -= 1;
                }
                None => break,
            }
        }
        alloc
    }

    pub fn share_of(&self, niche: &Niche) -> Option<f64> {
        self.niches.get(niche).map(|s| s.share)
    }

    pub fn fitness_of(&self, niche: &Niche) -> Option<f64> {
        self.niches.get(niche).map(|s| s.fitness)
    }

    pub fn niche_count(&self) -> usize {
        self.niches.len()
    }

    /// Stop tracking niches that fail the predicate (e.g. whose champions
    /// were pruned), renormalizing the survivors.
    pub fn retain(&mut self, keep: impl Fn(&Niche) -> bool) {
        self.niches.retain(|n, _| keep(n));
        if !self.niches.is_empty() {
            self.renormalize();
        }
    }
}
