//! Graph mutation
//!
//! Mutation jitters a parent graph's continuous node params with bounded
//! gaussian noise. Structure never changes here: nodes, edges and declared
//! effects are copied verbatim, so a mutant's effect profile is exactly its
//! parent's and the safety gate sees nothing new. Structural mutation would
//! need its own gate review and is deliberately out of this function.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use tactica_common::PolicyGraph;

/// Clone `parent` with each node param jittered by `N(0, std)`, clamped to
/// `[min, max]`.
///
/// A graph without params (the no-op fallback shape) gains nothing from
/// jitter; the caller decides whether such clones are worth minting.
pub fn mutate_graph<R: Rng + ?Sized>(
    parent: &PolicyGraph,
    std: f64,
    min: f64,
    max: f64,
    rng: &mut R,
) -> PolicyGraph {
    let normal = match Normal::new(0.0, std.abs().max(f64::MIN_POSITIVE)) {
        Ok(n) => n,
        Err(_) => return parent.clone(),
    };

    let mut child = parent.clone();
    for node in &mut child.nodes {
        for value in node.params.values_mut() {
            let jittered = *value + normal.sample(rng);
            *value = jittered.clamp(min, max);
        }
    }
    child
}
