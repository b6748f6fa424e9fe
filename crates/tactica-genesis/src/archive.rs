//! Quality-Diversity archive
//!
//! One champion arm per behavior-space niche, replaced only when a new score
//! clears the incumbent by the hysteresis margin. Visit counts drive the
//! inverse-frequency niche sampling Genesis uses to spread mutation effort
//! toward under-explored behavior.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use tactica_common::Niche;

#[derive(Debug, Clone)]
struct ArchiveEntry {
    champion_arm_id: String,
    score: f64,
    visit_count: u64,
}

/// Summary counters for diagnostics
#[derive(Debug, Clone)]
pub struct ArchiveStats {
    pub niches: usize,
    pub total_visits: u64,
}

/// Niche-keyed champion archive with replacement hysteresis
pub struct QdArchive {
    entries: RwLock<BTreeMap<Niche, ArchiveEntry>>,
    epsilon: f64,
}

impl QdArchive {
    pub fn new(epsilon: f64) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            epsilon: if epsilon.is_finite() && epsilon >= 0.0 {
                epsilon
            } else {
                0.0
            },
        }
    }

    /// Record an episode's score for its niche.
    ///
    /// The visit count always advances; the champion changes only when the
    /// new score beats the incumbent by more than the hysteresis margin.
    /// Non-finite scores count as visits but never crown a champion.
    pub fn insert(&self, niche: Niche, arm_id: &str, score: f64) {
        let mut entries = self.entries.write();
        match entries.get_mut(&niche) {
            Some(entry) => {
                entry.visit_count += 1;
                if score.is_finite() && score > entry.score + self.epsilon {
                    debug!(
                        %niche,
                        old = %entry.champion_arm_id,
                        new = arm_id,
                        score,
                        "niche champion replaced"
                    );
                    entry.champion_arm_id = arm_id.to_string();
                    entry.score = score;
                }
            }
            None => {
                entries.insert(
                    niche,
                    ArchiveEntry {
                        champion_arm_id: arm_id.to_string(),
                        score: if score.is_finite() { score } else { f64::MIN },
                        visit_count: 1,
                    },
                );
            }
        }
    }

    /// Current champion arm id for a niche, if any episode has landed there
    pub fn champion_of(&self, niche: &Niche) -> Option<String> {
        self.entries
            .read()
            .get(niche)
            .map(|e| e.champion_arm_id.clone())
    }

    /// Champion score for a niche
    pub fn score_of(&self, niche: &Niche) -> Option<f64> {
        self.entries.read().get(niche).map(|e| e.score)
    }

    /// Drop entries whose champion arm no longer exists.
    ///
    /// Called after pruning so a dead arm cannot keep seeding mutations.
    pub fn retain_champions(&self, is_alive: impl Fn(&str) -> bool) {
        self.entries
            .write()
            .retain(|_, entry| is_alive(&entry.champion_arm_id));
    }

    /// All niches currently holding a champion, in key order
    pub fn niches(&self) -> Vec<Niche> {
        self.entries.read().keys().cloned().collect()
    }

    /// Sample a niche weighted toward the rarely visited.
    ///
    /// Weight is `1 / sqrt(visits + 1)`, so a niche with one visit is about
    /// ten times likelier than one with a hundred. Returns `None` on an
    /// empty archive.
    pub fn sample_niche<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Niche> {
        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }

        let weights: Vec<(Niche, f64)> = entries
            .iter()
            .map(|(n, e)| (n.clone(), 1.0 / ((e.visit_count as f64) + 1.0).sqrt()))
            .collect();
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if !(total > 0.0) {
            // degenerate weights; fall back to uniform over key order
            let idx = rng.gen_range(0..weights.len());
            return Some(weights[idx].0.clone());
        }

        let mut draw = rng.gen_range(0.0..total);
        for (niche, w) in &weights {
            draw -= w;
            if draw <= 0.0 {
                return Some(niche.clone());
            }
        }
        weights.last().map(|(n, _)| n.clone())
    }

    pub fn stats(&self) -> ArchiveStats {
        let entries = self.entries.read();
        ArchiveStats {
            niches: entries.len(),
            total_visits: entries.values().map(|e| e.visit_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn niche(name: &str) -> Niche {
        Niche::new(name, "low", "low")
    }

    #[test]
    fn test_first_insert_crowns_champion() {
        let archive = QdArchive::new(0.01);
        archive.insert(niche("a"), "arm-1", 0.5);

        assert_eq!(archive.champion_of(&niche("a")), Some("arm-1".to_string()));
        assert_eq!(archive.score_of(&niche("a")), Some(0.5));
    }

    #[test]
    fn test_hysteresis_blocks_marginal_challenger() {
        let archive = QdArchive::new(0.01);
        archive.insert(niche("a"), "incumbent", 0.5);

        // within epsilon of the champion: no change
        archive.insert(niche("a"), "challenger", 0.505);
        assert_eq!(
            archive.champion_of(&niche("a")),
            Some("incumbent".to_string())
        );

        // clears the margin: replaced
        archive.insert(niche("a"), "challenger", 0.52);
        assert_eq!(
            archive.champion_of(&niche("a")),
            Some("challenger".to_string())
        );
    }

    #[test]
    fn test_visits_advance_even_without_replacement() {
        let archive = QdArchive::new(0.01);
        archive.insert(niche("a"), "arm-1", 0.9);
        archive.insert(niche("a"), "arm-2", 0.1);
        archive.insert(niche("a"), "arm-3", f64::NAN);

        let stats = archive.stats();
        assert_eq!(stats.niches, 1);
        assert_eq!(stats.total_visits, 3);
        assert_eq!(archive.champion_of(&niche("a")), Some("arm-1".to_string()));
    }

    #[test]
    fn test_retain_champions_drops_dead_arms() {
        let archive = QdArchive::new(0.01);
        archive.insert(niche("a"), "alive", 0.5);
        archive.insert(niche("b"), "pruned", 0.5);

        archive.retain_champions(|id| id == "alive");
        assert_eq!(archive.niches(), vec![niche("a")]);
    }

    #[test]
    fn test_sampling_prefers_rare_niches() {
        let archive = QdArchive::new(0.01);
        archive.insert(niche("rare"), "a", 0.5);
        for _ in 0..400 {
            archive.insert(niche("common"), "b", 0.5);
        }

        let mut rng = StdRng::seed_from_u64(7);
        let mut rare_hits = 0;
        for _ in 0..1000 {
            if archive.sample_niche(&mut rng) == Some(niche("rare")) {
                rare_hits += 1;
            }
        }
        // weight ratio is sqrt(401/2) ≈ 14; rare should dominate clearly
        assert!(rare_hits > 700, "rare niche sampled only {rare_hits} times");
    }

    #[test]
    fn test_sample_empty_archive() {
        let archive = QdArchive::new(0.01);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(archive.sample_niche(&mut rng).is_none());
    }
}
