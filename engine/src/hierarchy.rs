// hierarchy.rs — Hierarchy resolver
//
// Computes, for every node of a raw graph, its hierarchy path (the stack of
// enclosing openers) and its match node (the innermost opener), or reports
// the structural error that prevents a consistent assignment. Loop back-edges
// are folded out before ordering; condition branches are popped at their join
// port; collapses pop the innermost expand.
//
// Preconditions: `graph` passed the raw-graph pre-pass and the descriptor
//                cardinality check.
// Postconditions: returns a `Resolution` with a path, match pointer, and
//                 topological position for every node, and the set of loop
//                 back-edges.
// Failure modes: every hierarchy-related kind of `GraphError`.
// Side effects: none. The resolver is pure and single-threaded.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use crate::descriptor::FlowunitCategory;
use crate::diag::GraphError;
use crate::graph::{Edge, GraphNode, RawGraph};
use crate::id::{EdgeId, NodeId};

// ── Path model ──────────────────────────────────────────────────────────────

/// One level on a node's hierarchy path, outermost first.
///
/// Conditions carry the branch (output port index) because distinct outputs
/// of a condition are mutually exclusive branches; expand outputs all belong
/// to one sub-stream level; a loop only deepens the level through its body
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathStep {
    Expand(NodeId),
    Branch(NodeId, usize),
    Loop(NodeId),
}

impl PathStep {
    /// The opener node of this level.
    pub fn opener(self) -> NodeId {
        match self {
            PathStep::Expand(n) | PathStep::Branch(n, _) | PathStep::Loop(n) => n,
        }
    }
}

pub type HierarchyPath = Vec<PathStep>;

/// Hierarchy metadata attached to one node.
#[derive(Debug, Clone, Default)]
pub struct NodeHierarchy {
    pub path: HierarchyPath,
    pub match_node: Option<NodeId>,
    /// The condition this node is the join of, if any.
    pub joined_condition: Option<NodeId>,
}

/// Output of the resolver.
#[derive(Debug)]
pub struct Resolution {
    hierarchy: Vec<NodeHierarchy>,
    back_edge: Vec<bool>,
    topo_order: Vec<NodeId>,
}

impl Resolution {
    pub fn node(&self, id: NodeId) -> &NodeHierarchy {
        &self.hierarchy[id.index()]
    }

    pub fn path(&self, id: NodeId) -> &[PathStep] {
        &self.hierarchy[id.index()].path
    }

    pub fn depth(&self, id: NodeId) -> usize {
        self.path(id).len()
    }

    pub fn match_node(&self, id: NodeId) -> Option<NodeId> {
        self.hierarchy[id.index()].match_node
    }

    pub fn is_back_edge(&self, id: EdgeId) -> bool {
        self.back_edge[id.index()]
    }

    /// Nodes in a deterministic topological order over the folded graph.
    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo_order
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Resolve hierarchy paths and match nodes for every node of `graph`.
pub fn resolve(graph: &RawGraph) -> Result<Resolution, GraphError> {
    let mut ctx = ResolveCtx::new(graph);
    ctx.fold_back_edges();
    ctx.propagate()?;
    ctx.verify_back_edges()?;
    ctx.audit_collapses()?;
    Ok(ctx.finish())
}

// ── Internal context ────────────────────────────────────────────────────────

struct ResolveCtx<'g> {
    graph: &'g RawGraph,
    out_edges: Vec<Vec<EdgeId>>,
    in_edges: Vec<Vec<EdgeId>>,
    back_edge: Vec<bool>,
    hierarchy: Vec<Option<NodeHierarchy>>,
    topo_order: Vec<NodeId>,
    /// condition → the node that joined it. At most one join per condition.
    joins: HashMap<NodeId, NodeId>,
    /// expand → collapses folding it.
    collapses: HashMap<NodeId, Vec<NodeId>>,
}

impl<'g> ResolveCtx<'g> {
    fn new(graph: &'g RawGraph) -> Self {
        let n = graph.node_count();
        let mut out_edges = vec![Vec::new(); n];
        let mut in_edges = vec![Vec::new(); n];
        for edge in graph.edges() {
            out_edges[edge.src.index()].push(edge.id);
            in_edges[edge.dst.index()].push(edge.id);
        }
        ResolveCtx {
            graph,
            out_edges,
            in_edges,
            back_edge: vec![false; graph.edges().len()],
            hierarchy: vec![None; n],
            topo_order: Vec::with_capacity(n),
            joins: HashMap::new(),
            collapses: HashMap::new(),
        }
    }

    fn node(&self, id: NodeId) -> &'g GraphNode {
        self.graph.node(id)
    }

    fn edge(&self, id: EdgeId) -> &'g Edge {
        self.graph.edge(id)
    }

    fn name(&self, id: NodeId) -> String {
        self.node(id).name.clone()
    }

    // ── Loop back-edge folding ──────────────────────────────────────────

    /// Mark every `(body terminus → loop first input)` edge as a back-edge
    /// so the topological pass can ignore it. A candidate source is any node
    /// reachable from the loop's body output (or the loop itself through
    /// that output). Scope verification happens after propagation.
    fn fold_back_edges(&mut self) {
        for node in self.graph.nodes() {
            if node.category() != FlowunitCategory::Loop {
                continue;
            }
            let desc = match node.descriptor() {
                Some(d) => d,
                None => continue,
            };
            let (body_out, loop_in) = match (desc.body_output(), desc.loop_input()) {
                (Some(o), Some(i)) => (o.to_string(), i.to_string()),
                _ => continue,
            };

            let reach = self.reachable_from(node.id, &body_out);
            for eid in self.in_edges[node.id.index()].clone() {
                let edge = self.graph.edge(eid);
                if edge.dst_port != loop_in {
                    continue;
                }
                let from_body_self = edge.src == node.id && edge.src_port == body_out;
                if reach.contains(&edge.src) || from_body_self {
                    self.back_edge[eid.index()] = true;
                }
            }
        }
    }

    /// Forward-reachable node set starting at `src`'s edges out of `port`.
    fn reachable_from(&self, src: NodeId, port: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for eid in &self.out_edges[src.index()] {
            let edge = self.graph.edge(*eid);
            if edge.src_port == port && seen.insert(edge.dst) {
                queue.push_back(edge.dst);
            }
        }
        while let Some(n) = queue.pop_front() {
            for eid in &self.out_edges[n.index()] {
                let dst = self.graph.edge(*eid).dst;
                if seen.insert(dst) {
                    queue.push_back(dst);
                }
            }
        }
        seen
    }

    // ── Forward propagation ─────────────────────────────────────────────

    /// Topological traversal over the folded graph with a name-ordered ready
    /// set, so the verdict does not depend on declaration order.
    fn propagate(&mut self) -> Result<(), GraphError> {
        let n = self.graph.node_count();
        let mut indegree = vec![0usize; n];
        for edge in self.graph.edges() {
            if !self.back_edge[edge.id.index()] {
                indegree[edge.dst.index()] += 1;
            }
        }

        let mut ready: BTreeSet<(String, NodeId)> = BTreeSet::new();
        for node in self.graph.nodes() {
            if indegree[node.id.index()] == 0 {
                ready.insert((node.name.clone(), node.id));
            }
        }

        while let Some((_, id)) = ready.pop_first() {
            let info = self.resolve_node(id)?;
            self.hierarchy[id.index()] = Some(info);
            self.topo_order.push(id);

            for eid in self.out_edges[id.index()].clone() {
                if self.back_edge[eid.index()] {
                    continue;
                }
                let dst = self.graph.edge(eid).dst;
                indegree[dst.index()] -= 1;
                if indegree[dst.index()] == 0 {
                    ready.insert((self.name(dst), dst));
                }
            }
        }

        if self.topo_order.len() < n {
            // A cycle not declared through a loop node. Report the first
            // stuck edge by name order.
            let stuck = self
                .graph
                .edges()
                .iter()
                .filter(|e| {
                    !self.back_edge[e.id.index()]
                        && self.hierarchy[e.dst.index()].is_none()
                        && self.hierarchy[e.src.index()].is_none()
                })
                .min_by_key(|e| (self.name(e.dst), e.dst_port.clone()))
                .expect("unprocessed nodes imply a stuck edge");
            return Err(GraphError::OverHierarchyLink {
                node: self.name(stuck.dst),
                port: stuck.dst_port.clone(),
            });
        }
        Ok(())
    }

    /// Hierarchy path carried by one edge, as seen from its source side.
    fn edge_path(&self, edge: &Edge) -> HierarchyPath {
        let src = self.node(edge.src);
        let mut path = self.hierarchy[edge.src.index()]
            .as_ref()
            .expect("edge source resolved before destination")
            .path
            .clone();
        match src.category() {
            FlowunitCategory::Condition => {
                let branch = src
                    .descriptor()
                    .and_then(|d| d.output_index(&edge.src_port))
                    .unwrap_or(0);
                path.push(PathStep::Branch(edge.src, branch));
            }
            FlowunitCategory::Expand => path.push(PathStep::Expand(edge.src)),
            FlowunitCategory::Loop => {
                let body = src.descriptor().and_then(|d| d.body_output());
                if body == Some(edge.src_port.as_str()) {
                    path.push(PathStep::Loop(edge.src));
                }
            }
            _ => {}
        }
        path
    }

    /// Resolve one node: per-port paths (with condition joins), cross-port
    /// reconciliation, collapse pop, match assignment.
    fn resolve_node(&mut self, id: NodeId) -> Result<NodeHierarchy, GraphError> {
        // Ports in name order for a deterministic first conflict.
        let mut ports: BTreeMap<&'g str, Vec<EdgeId>> = BTreeMap::new();
        for eid in self.in_edges[id.index()].clone() {
            if self.back_edge[eid.index()] {
                continue;
            }
            let edge = self.edge(eid);
            ports.entry(edge.dst_port.as_str()).or_default().push(eid);
        }

        if ports.is_empty() {
            // Graph inputs and source flowunits sit at the top level.
            return Ok(NodeHierarchy::default());
        }

        let mut joined: Option<NodeId> = None;
        let mut resolved: Vec<(&str, HierarchyPath)> = Vec::with_capacity(ports.len());
        for (port, edges) in &ports {
            let (path, port_join) = self.resolve_port(id, port, edges)?;
            if let Some(cond) = port_join {
                self.register_join(cond, id)?;
                if joined.is_some() && joined != Some(cond) {
                    return Err(GraphError::AmbiguousConditionJoin {
                        condition: self.name(cond),
                        node: self.name(id),
                    });
                }
                joined = Some(cond);
            }
            resolved.push((*port, path));
        }

        // Cross-port reconciliation: every port must sit on the same level.
        let (first_port, common) = {
            let (p, path) = &resolved[0];
            (*p, path.clone())
        };
        for (port, path) in &resolved[1..] {
            if *path != common {
                return Err(self.conflict(id, (first_port, &common), (*port, path)));
            }
        }

        self.finish_node(id, common, joined)
    }

    /// Resolve one input port: a single edge contributes its source path; a
    /// multi-edge port must either merge distinct branches of one condition
    /// (popping it) or merge distinct exit outputs of one loop.
    fn resolve_port(
        &self,
        id: NodeId,
        port: &str,
        edges: &[EdgeId],
    ) -> Result<(HierarchyPath, Option<NodeId>), GraphError> {
        if edges.len() == 1 {
            return Ok((self.edge_path(self.graph.edge(edges[0])), None));
        }

        if let Some(path) = self.loop_exit_merge(edges) {
            return Ok((path, None));
        }

        // Sorted so the reported conflict does not depend on edge order.
        let mut paths: Vec<HierarchyPath> = edges
            .iter()
            .map(|eid| self.edge_path(self.edge(*eid)))
            .collect();
        paths.sort();

        // The join case requires every tail to be a branch of one condition.
        let mut condition: Option<NodeId> = None;
        let mut is_branch_merge = true;
        for path in &paths {
            match path.last() {
                Some(PathStep::Branch(cond, _)) => {
                    if *condition.get_or_insert(*cond) != *cond {
                        is_branch_merge = false;
                        break;
                    }
                }
                _ => {
                    is_branch_merge = false;
                    break;
                }
            }
        }
        if !is_branch_merge {
            // Equal paths are unrelated fan-in; unequal paths are a
            // hierarchy conflict between the two extreme levels.
            let last = paths.last().expect("multi-edge port");
            return if last == &paths[0] {
                Err(GraphError::PortFanInConflict {
                    node: self.name(id),
                    port: port.to_string(),
                })
            } else {
                Err(self.conflict(id, (port, &paths[0]), (port, last)))
            };
        }

        // Distinct branches, one shared prefix; the port pops the condition.
        let mut branches = BTreeSet::new();
        for path in &paths {
            if let Some(PathStep::Branch(_, branch)) = path.last() {
                if !branches.insert(*branch) {
                    // Two edges from the same branch are plain fan-in.
                    return Err(GraphError::PortFanInConflict {
                        node: self.name(id),
                        port: port.to_string(),
                    });
                }
            }
        }
        let prefix = &paths[0][..paths[0].len() - 1];
        for path in &paths[1..] {
            if &path[..path.len() - 1] != prefix {
                return Err(self.conflict(id, (port, &paths[0]), (port, path)));
            }
        }

        Ok((prefix.to_vec(), condition))
    }

    /// A multi-edge port is also legal when every edge comes straight from a
    /// distinct exit output of the same loop node.
    fn loop_exit_merge(&self, edges: &[EdgeId]) -> Option<HierarchyPath> {
        let first = self.graph.edge(edges[0]);
        let src = self.node(first.src);
        if src.category() != FlowunitCategory::Loop {
            return None;
        }
        let body = src.descriptor()?.body_output()?.to_string();
        let mut seen_ports = BTreeSet::new();
        for eid in edges {
            let edge = self.graph.edge(*eid);
            if edge.src != first.src || edge.src_port == body {
                return None;
            }
            if !seen_ports.insert(edge.src_port.clone()) {
                return None;
            }
        }
        Some(self.edge_path(first))
    }

    /// A condition has exactly one join point. A second registration (a
    /// second node, or a second port of the same node) leaves runtime
    /// pairing undefined.
    fn register_join(&mut self, condition: NodeId, join: NodeId) -> Result<(), GraphError> {
        if self.joins.insert(condition, join).is_some() {
            return Err(GraphError::AmbiguousConditionJoin {
                condition: self.name(condition),
                node: self.name(join),
            });
        }
        Ok(())
    }

    /// Apply the collapse pop, check graph-output levels, assign the match.
    fn finish_node(
        &mut self,
        id: NodeId,
        mut path: HierarchyPath,
        joined: Option<NodeId>,
    ) -> Result<NodeHierarchy, GraphError> {
        let node = self.node(id);

        if node.category() == FlowunitCategory::Collapse {
            return match path.pop() {
                Some(PathStep::Expand(expand)) => {
                    self.collapses.entry(expand).or_default().push(id);
                    Ok(NodeHierarchy {
                        path,
                        match_node: Some(expand),
                        joined_condition: joined,
                    })
                }
                Some(_) if path.iter().any(|s| matches!(s, PathStep::Expand(_))) => {
                    Err(GraphError::OverHierarchyLink {
                        node: self.name(id),
                        port: node.input_ports().first().unwrap_or(&"").to_string(),
                    })
                }
                _ => Err(GraphError::CollapseWithoutExpand {
                    node: self.name(id),
                }),
            };
        }

        if node.is_output_virtual() && !path.is_empty() {
            // Graph outputs are top-level consumers.
            return Err(match *path.last().expect("nonempty") {
                PathStep::Expand(expand) => GraphError::UncollapsedExpand {
                    expand: self.name(expand),
                    node: self.name(id),
                },
                PathStep::Branch(cond, _) => GraphError::ConditionBranchLeak {
                    condition: self.name(cond),
                    node: self.name(id),
                },
                PathStep::Loop(l) => GraphError::LoopBackEdgeScope {
                    loop_node: self.name(l),
                    node: self.name(id),
                },
            });
        }

        let match_node = joined.or_else(|| path.last().map(|s| s.opener()));
        Ok(NodeHierarchy {
            path,
            match_node,
            joined_condition: joined,
        })
    }

    /// Classify a path conflict between two ports (or two edges of one port).
    fn conflict(
        &self,
        id: NodeId,
        a: (&str, &HierarchyPath),
        b: (&str, &HierarchyPath),
    ) -> GraphError {
        let (port_a, path_a) = a;
        let (port_b, path_b) = b;
        let shared = path_a
            .iter()
            .zip(path_b.iter())
            .take_while(|(x, y)| x == y)
            .count();

        if let (Some(PathStep::Branch(c1, b1)), Some(PathStep::Branch(c2, b2))) =
            (path_a.get(shared), path_b.get(shared))
        {
            if c1 == c2 && b1 != b2 {
                // Sibling branches arriving on different ports claim two
                // different join points.
                return GraphError::AmbiguousConditionJoin {
                    condition: self.name(*c1),
                    node: self.name(id),
                };
            }
        }

        if shared == path_a.len().min(path_b.len()) && path_a.len() != path_b.len() {
            // One level is a prefix of the other: an edge crossed out of a
            // region without the closing node. Classify by the innermost
            // unmatched level.
            let (deep_port, deep) = if path_a.len() > path_b.len() {
                (port_a, path_a)
            } else {
                (port_b, path_b)
            };
            return match *deep.last().expect("longer path is nonempty") {
                PathStep::Expand(_) => GraphError::OverHierarchyLink {
                    node: self.name(id),
                    port: deep_port.to_string(),
                },
                PathStep::Branch(cond, _) => GraphError::ConditionCrossOverEdge {
                    condition: self.name(cond),
                    node: self.name(id),
                },
                PathStep::Loop(l) => GraphError::LoopBackEdgeScope {
                    loop_node: self.name(l),
                    node: self.name(id),
                },
            };
        }

        GraphError::HierarchyMismatch {
            node: self.name(id),
        }
    }

    // ── Post-propagation audits ─────────────────────────────────────────

    /// Every folded edge must close exactly on its loop, from body level.
    fn verify_back_edges(&self) -> Result<(), GraphError> {
        for edge in self.graph.edges() {
            if !self.back_edge[edge.id.index()] {
                continue;
            }
            let loop_id = edge.dst;
            let mut expected = self.hierarchy[loop_id.index()]
                .as_ref()
                .expect("loop resolved")
                .path
                .clone();
            expected.push(PathStep::Loop(loop_id));
            if self.edge_path(edge) != expected {
                return Err(GraphError::LoopBackEdgeScope {
                    loop_node: self.name(loop_id),
                    node: self.name(edge.src),
                });
            }
        }
        Ok(())
    }

    /// Two collapses may fold the same expand only from disjoint sub-paths
    /// of its region (separate expand outputs or separate branches).
    fn audit_collapses(&self) -> Result<(), GraphError> {
        let mut expands: Vec<&NodeId> = self.collapses.keys().collect();
        expands.sort_by_key(|e| self.name(**e));

        for expand in expands {
            let mut folds = self.collapses[expand].clone();
            if folds.len() < 2 {
                continue;
            }
            folds.sort_by_key(|c| self.name(*c));

            let depth = self.hierarchy[expand.index()]
                .as_ref()
                .expect("expand resolved")
                .path
                .len();
            let in_region = |n: NodeId| {
                self.hierarchy[n.index()]
                    .as_ref()
                    .map(|h| h.path.get(depth) == Some(&PathStep::Expand(*expand)))
                    .unwrap_or(false)
            };

            let upstreams: Vec<HashSet<NodeId>> = folds
                .iter()
                .map(|c| self.region_upstream(*c, &in_region))
                .collect();
            for i in 0..folds.len() {
                for j in i + 1..folds.len() {
                    if !upstreams[i].is_disjoint(&upstreams[j]) {
                        return Err(GraphError::AmbiguousCollapse {
                            expand: self.name(*expand),
                            first: self.name(folds[i]),
                            second: self.name(folds[j]),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Region-internal nodes that can reach `from` (reverse reachability,
    /// back-edges excluded).
    fn region_upstream(&self, from: NodeId, in_region: &dyn Fn(NodeId) -> bool) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        while let Some(n) = queue.pop_front() {
            for eid in &self.in_edges[n.index()] {
                if self.back_edge[eid.index()] {
                    continue;
                }
                let src = self.graph.edge(*eid).src;
                if in_region(src) && seen.insert(src) {
                    queue.push_back(src);
                }
            }
        }
        seen
    }

    fn finish(self) -> Resolution {
        Resolution {
            hierarchy: self
                .hierarchy
                .into_iter()
                .map(|h| h.expect("all nodes resolved"))
                .collect(),
            back_edge: self.back_edge,
            topo_order: self.topo_order,
        }
    }
}
