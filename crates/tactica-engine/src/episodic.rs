//! Episodic warm-start index
//!
//! A bounded memory of (feature vector, arm, reward) exemplars from
//! successful episodes. Its only job is suggesting warm-start candidates to
//! the selector: given a fresh context it returns the arms that worked for
//! the nearest past contexts, ranked by cosine similarity.

use std::collections::{HashSet, VecDeque};

use ordered_float::OrderedFloat;
use parking_lot::RwLock;

/// One stored exemplar
#[derive(Debug, Clone)]
struct Exemplar {
    feature: Vec<f64>,
    arm_id: String,
    reward: f64,
}

/// Bounded nearest-neighbor memory over past successes
pub struct EpisodicIndex {
    entries: RwLock<VecDeque<Exemplar>>,
    capacity: usize,
}

impl EpisodicIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Store an exemplar, evicting the oldest when full
    pub fn insert(&self, feature: Vec<f64>, arm_id: impl Into<String>, reward: f64) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(Exemplar {
            feature,
            arm_id: arm_id.into(),
            reward,
        });
    }

    /// Up to `k` distinct arm ids whose exemplars are closest to `x`.
    ///
    /// Neighbors are ranked by cosine similarity with the stored reward as a
    /// tie-light multiplier, so an arm that barely cleared the success
    /// threshold ranks behind one that excelled at the same distance.
    pub fn suggest(&self, x: &[f64], k: usize) -> Vec<String> {
        if k == 0 {
            return Vec::new();
        }
        let entries = self.entries.read();
        let mut scored: Vec<(OrderedFloat<f64>, &str)> = entries
            .iter()
            .map(|e| {
                let sim = cosine_similarity(&e.feature, x);
                (OrderedFloat(sim * e.reward.max(0.0)), e.arm_id.as_str())
            })
            .filter(|(score, _)| score.0 > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(k);
        for (_, arm_id) in scored {
            if seen.insert(arm_id) {
                out.push(arm_id.to_string());
                if out.len() == k {
                    break;
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
