//! Effect-typed safety gate
//!
//! A pure structural check over a policy graph's declared side effects.
//! The forbidden-combination table is configuration, not code: it can be
//! loaded from a JSON file without recompiling. The gate runs at mint time
//! (Genesis) and again at selection time before an arm is allowed to
//! execute; it never mutates the graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tactica_common::{Effect, GateError, PolicyGraph};

/// Data-driven table of forbidden effect combinations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectPolicy {
    /// Each entry is a set of effects that must not all be declared across
    /// one graph (the check runs on the union over all nodes)
    pub forbidden: Vec<BTreeSet<Effect>>,
}

impl Default for EffectPolicy {
    fn default() -> Self {
        Self {
            forbidden: vec![
                [Effect::Write, Effect::NetAccess].into_iter().collect(),
                [Effect::Execute, Effect::StateChange].into_iter().collect(),
            ],
        }
    }
}

impl EffectPolicy {
    /// Load a forbidden-combination table from a JSON file
    pub fn from_file(path: &str) -> Result<Self, GateError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::PolicyLoad(format!("failed to read {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| GateError::PolicyLoad(format!("failed to parse {}: {}", path, e)))
    }
}

/// Static firewall validating policy graphs against an effect policy
#[derive(Debug, Clone)]
pub struct SafetyGate {
    policy: EffectPolicy,
}

impl SafetyGate {
    pub fn new(policy: EffectPolicy) -> Self {
        Self { policy }
    }

    /// Validate a graph: `Ok(())` if no forbidden combination is declared,
    /// otherwise the first violating combination.
    ///
    /// Effects are unioned across all nodes first, so a combination split
    /// over different nodes is still rejected.
    pub fn validate(&self, graph: &PolicyGraph) -> Result<(), GateError> {
        let declared = graph.effect_union();
        for combo in &self.policy.forbidden {
            if combo.is_subset(&declared) {
                return Err(GateError::ForbiddenCombination {
                    combo: combo.iter().copied().collect(),
                });
            }
        }
        Ok(())
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new(EffectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tactica_common::{NodeKind, PolicyNode};

    #[test]
    fn test_write_plus_net_access_across_nodes_rejected() {
        let gate = SafetyGate::default();
        let graph = PolicyGraph::new()
            .with_node(PolicyNode::new("fetch", NodeKind::Tool).with_effect(Effect::NetAccess))
            .with_node(PolicyNode::new("save", NodeKind::Tool).with_effect(Effect::Write));

        let err = gate.validate(&graph).unwrap_err();
        assert!(matches!(err, GateError::ForbiddenCombination { .. }));
    }

    #[test]
    fn test_read_only_graph_accepted() {
        let gate = SafetyGate::default();
        let graph = PolicyGraph::new()
            .with_node(PolicyNode::new("scan", NodeKind::Tool).with_effect(Effect::Read));
        assert!(gate.validate(&graph).is_ok());
    }

    #[test]
    fn test_noop_graph_accepted() {
        let gate = SafetyGate::default();
        assert!(gate.validate(&PolicyGraph::noop("fallback")).is_ok());
    }

    #[test]
    fn test_custom_policy_overrides_default() {
        // a policy that forbids execute on its own
        let policy = EffectPolicy {
            forbidden: vec![[Effect::Execute].into_iter().collect()],
        };
        let gate = SafetyGate::new(policy);

        let exec = PolicyGraph::new()
            .with_node(PolicyNode::new("run", NodeKind::Tool).with_effect(Effect::Execute));
        assert!(gate.validate(&exec).is_err());

        // write + net_access is allowed under this custom table
        let wn = PolicyGraph::new()
            .with_node(
                PolicyNode::new("sync", NodeKind::Tool)
                    .with_effect(Effect::Write)
                    .with_effect(Effect::NetAccess),
            );
        assert!(gate.validate(&wn).is_ok());
    }
}
