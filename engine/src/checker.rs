// checker.rs — Structural checker
//
// Runs the structural rules in a fixed order: descriptor cardinality
// constraints on each node, then hierarchy resolution (which subsumes the
// port fan-in rules at join ports), and returns the enriched graph. Fails
// fast with the first offending node or edge; the caller-visible verdict is
// the coarse `Status`.
//
// Preconditions: `graph` passed the raw-graph pre-pass (node/port existence).
// Postconditions: on success every node carries a hierarchy path and match
//                 pointer, queryable by name.
// Failure modes: every kind in the checker taxonomy.
// Side effects: none.

use crate::descriptor::FlowunitCategory;
use crate::diag::{GraphError, Status};
use crate::graph::{GraphNode, RawGraph};
use crate::hierarchy::{self, PathStep, Resolution};
use crate::id::NodeId;

// ── Checked graph ───────────────────────────────────────────────────────────

/// A validated graph: the raw graph plus hierarchy metadata. Immutable;
/// consumed by the assembler.
#[derive(Debug)]
pub struct CheckedGraph {
    graph: RawGraph,
    resolution: Resolution,
}

impl CheckedGraph {
    pub fn graph(&self) -> &RawGraph {
        &self.graph
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// The match node computed for `name`, if the node exists and has one.
    pub fn match_node(&self, name: &str) -> Option<&GraphNode> {
        let node = self.graph.node_by_name(name)?;
        let match_id = self.resolution.match_node(node.id)?;
        Some(self.graph.node(match_id))
    }

    /// The stack of openers enclosing `name`, outermost first.
    pub fn hierarchy_path(&self, name: &str) -> Option<Vec<&GraphNode>> {
        let node = self.graph.node_by_name(name)?;
        Some(
            self.resolution
                .path(node.id)
                .iter()
                .map(|step| self.graph.node(step.opener()))
                .collect(),
        )
    }

    pub fn depth(&self, name: &str) -> Option<usize> {
        let node = self.graph.node_by_name(name)?;
        Some(self.resolution.depth(node.id))
    }
}

// ── Entry points ────────────────────────────────────────────────────────────

/// Validate `graph`, attaching hierarchy metadata on success.
pub fn check(graph: RawGraph) -> Result<CheckedGraph, GraphError> {
    check_cardinality(&graph)?;
    let resolution = hierarchy::resolve(&graph)?;
    Ok(CheckedGraph { graph, resolution })
}

/// The coarse verdict for `graph`, as seen at the engine boundary.
pub fn check_status(graph: RawGraph) -> Status {
    check(graph).into()
}

// ── Descriptor cardinality ──────────────────────────────────────────────────

/// Category-specific port count invariants, applied to each node used in the
/// graph. Nodes are visited in name order so the first error does not depend
/// on declaration order.
fn check_cardinality(graph: &RawGraph) -> Result<(), GraphError> {
    let mut nodes: Vec<&GraphNode> = graph.nodes().iter().collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    for node in nodes {
        let desc = match node.descriptor() {
            Some(d) => d,
            None => continue,
        };
        let (inputs, outputs) = (desc.inputs().len(), desc.outputs().len());
        let violation = match desc.category() {
            FlowunitCategory::Condition => {
                if inputs != 1 || outputs < 2 {
                    Some("a condition needs exactly one input and at least two outputs")
                } else {
                    None
                }
            }
            FlowunitCategory::Expand => {
                if inputs != 1 {
                    Some("an expand needs exactly one input")
                } else {
                    None
                }
            }
            FlowunitCategory::Collapse => {
                if outputs != 1 {
                    Some("a collapse needs exactly one output")
                } else {
                    None
                }
            }
            FlowunitCategory::Loop => {
                if inputs != 1 || outputs < 2 {
                    Some("a loop needs exactly one input and at least two outputs")
                } else {
                    None
                }
            }
            FlowunitCategory::Normal | FlowunitCategory::Stream => None,
        };
        if let Some(detail) = violation {
            return Err(GraphError::CardinalityViolation {
                node: node.name.clone(),
                flowunit: desc.name().to_string(),
                detail: detail.to_string(),
            });
        }
    }
    Ok(())
}

// ── Invariant helpers (used by tests and embedders) ─────────────────────────

impl CheckedGraph {
    /// True when `id` opens a hierarchy level.
    pub fn is_opener(&self, id: NodeId) -> bool {
        self.graph.node(id).category().is_opener()
    }

    /// The innermost path step of `name`, if any.
    pub fn innermost_step(&self, name: &str) -> Option<PathStep> {
        let node = self.graph.node_by_name(name)?;
        self.resolution.path(node.id).last().copied()
    }
}
