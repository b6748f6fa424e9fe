//! Policy graph types
//!
//! An arm's executable shape: a small directed graph of typed nodes, each
//! optionally declaring side effects. Graphs are structurally immutable once
//! minted; Genesis mutations always produce a new graph under a new arm id.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Side effect a policy node may declare
///
/// This is a closed taxonomy; the forbidden-combination table that interprets
/// it is configuration, not code (see the engine's safety gate).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Read,
    Write,
    NetAccess,
    Execute,
    StateChange,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Effect::Read => "read",
            Effect::Write => "write",
            Effect::NetAccess => "net_access",
            Effect::Execute => "execute",
            Effect::StateChange => "state_change",
        };
        write!(f, "{}", s)
    }
}

/// Node type within a policy graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Prompt,
    Tool,
    Guard,
    Subgraph,
}

/// A single step in a policy graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyNode {
    /// Node identifier, unique within its graph
    pub id: String,

    /// What kind of step this is
    pub kind: NodeKind,

    /// Side effects this node declares
    #[serde(default)]
    pub effects: BTreeSet<Effect>,

    /// Continuous knobs (e.g. a temperature-like scalar) that population
    /// mutation may jitter within bounds
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl PolicyNode {
    /// Create a node with no effects and no params
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            effects: BTreeSet::new(),
            params: BTreeMap::new(),
        }
    }

    /// Declare an effect on this node
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.insert(effect);
        self
    }

    /// Set a continuous parameter
    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// A directed graph of policy nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyGraph {
    /// Nodes in insertion order
    pub nodes: Vec<PolicyNode>,

    /// Directed edges as (from node id, to node id)
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

impl PolicyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Minimal no-op graph: a single prompt node with no effects.
    ///
    /// This is the shape cold-start repair seeds as the guaranteed safe
    /// fallback for a mode.
    pub fn noop(label: impl Into<String>) -> Self {
        Self {
            nodes: vec![PolicyNode::new(label, NodeKind::Prompt)],
            edges: Vec::new(),
        }
    }

    /// Add a node
    pub fn with_node(mut self, node: PolicyNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a directed edge
    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&PolicyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Union of all effects declared across all nodes.
    ///
    /// The safety gate evaluates forbidden combinations over this union, so
    /// effects split across different nodes are still caught.
    pub fn effect_union(&self) -> BTreeSet<Effect> {
        self.nodes
            .iter()
            .flat_map(|n| n.effects.iter().copied())
            .collect()
    }

    /// True if no node declares any effect
    pub fn is_effect_free(&self) -> bool {
        self.nodes.iter().all(|n| n.effects.is_empty())
    }

    /// Serialize to the JSON form used by the durable store contract
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from the JSON form used by the durable store contract
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for PolicyGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_union_spans_nodes() {
        let graph = PolicyGraph::new()
            .with_node(PolicyNode::new("fetch", NodeKind::Tool).with_effect(Effect::NetAccess))
            .with_node(PolicyNode::new("save", NodeKind::Tool).with_effect(Effect::Write))
            .with_edge("fetch", "save");

        let union = graph.effect_union();
        assert!(union.contains(&Effect::NetAccess));
        assert!(union.contains(&Effect::Write));
        assert_eq!(union.len(), 2);
    }

    #[test]
    fn test_noop_graph_is_effect_free() {
        let graph = PolicyGraph::noop("fallback");
        assert!(graph.is_effect_free());
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].kind, NodeKind::Prompt);
    }

    #[test]
    fn test_json_round_trip_preserves_params() {
        let graph = PolicyGraph::new().with_node(
            PolicyNode::new("gen", NodeKind::Prompt).with_param("temperature", 0.7),
        );

        let json = graph.to_json().unwrap();
        let back = PolicyGraph::from_json(&json).unwrap();
        assert_eq!(back.node("gen").unwrap().params["temperature"], 0.7);
    }
}
