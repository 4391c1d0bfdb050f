// graph.rs — Raw graph model
//
// Post-parse immutable node/edge representation with port qualification.
// The builder consumes a resolved node/edge list (a separate stage parses
// textual graph sources) and runs the pre-pass validation: referenced nodes
// exist, referenced ports exist on the corresponding descriptors, and device
// bindings are present where descriptors require them.
//
// Preconditions: descriptors for all referenced flowunits are registered.
// Postconditions: `build` returns a `RawGraph` whose edges all reference
//                 existing nodes and ports.
// Failure modes: `BadGraphSyntax`, `UnknownFlowunit`, `UnknownPort`.
// Side effects: none.

use std::collections::HashMap;
use std::sync::Arc;

use crate::descriptor::{DescriptorRegistry, FlowunitCategory, FlowunitDesc};
use crate::diag::GraphError;
use crate::id::{EdgeId, IdAllocator, NodeId};

// ── Node/edge value types ───────────────────────────────────────────────────

/// Device placement of a flowunit node. Irrelevant to the checker; carried
/// through to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub device: String,
    pub device_id: u32,
}

impl DeviceBinding {
    pub fn cpu() -> Self {
        DeviceBinding {
            device: "cpu".to_string(),
            device_id: 0,
        }
    }
}

/// What a graph node is: a flowunit use, or one of the two synthetic node
/// kinds framing the graph.
#[derive(Debug, Clone)]
pub enum GraphNodeKind {
    Flowunit {
        desc: Arc<FlowunitDesc>,
        device: DeviceBinding,
    },
    /// Supplies externally-injected buffers. Its single output port bears
    /// the node's own name.
    InputVirtual,
    /// Surfaces buffers to the external caller. Its single input port bears
    /// the node's own name.
    OutputVirtual,
}

/// A use of a flowunit (or virtual node) with a graph-unique name.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub name: String,
    pub kind: GraphNodeKind,
}

impl GraphNode {
    pub fn descriptor(&self) -> Option<&Arc<FlowunitDesc>> {
        match &self.kind {
            GraphNodeKind::Flowunit { desc, .. } => Some(desc),
            _ => None,
        }
    }

    /// Category used by the checker. Virtual nodes behave as plain stream
    /// endpoints.
    pub fn category(&self) -> FlowunitCategory {
        match &self.kind {
            GraphNodeKind::Flowunit { desc, .. } => desc.category(),
            GraphNodeKind::InputVirtual | GraphNodeKind::OutputVirtual => {
                FlowunitCategory::Stream
            }
        }
    }

    pub fn is_input_virtual(&self) -> bool {
        matches!(self.kind, GraphNodeKind::InputVirtual)
    }

    pub fn is_output_virtual(&self) -> bool {
        matches!(self.kind, GraphNodeKind::OutputVirtual)
    }

    pub fn input_ports(&self) -> Vec<&str> {
        match &self.kind {
            GraphNodeKind::Flowunit { desc, .. } => {
                desc.inputs().iter().map(|s| s.as_str()).collect()
            }
            GraphNodeKind::InputVirtual => Vec::new(),
            GraphNodeKind::OutputVirtual => vec![self.name.as_str()],
        }
    }

    pub fn output_ports(&self) -> Vec<&str> {
        match &self.kind {
            GraphNodeKind::Flowunit { desc, .. } => {
                desc.outputs().iter().map(|s| s.as_str()).collect()
            }
            GraphNodeKind::InputVirtual => vec![self.name.as_str()],
            GraphNodeKind::OutputVirtual => Vec::new(),
        }
    }

    fn has_input_port(&self, port: &str) -> bool {
        self.input_ports().iter().any(|p| *p == port)
    }

    fn has_output_port(&self, port: &str) -> bool {
        self.output_ports().iter().any(|p| *p == port)
    }
}

/// A directed edge between two port-qualified endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub src: NodeId,
    pub src_port: String,
    pub dst: NodeId,
    pub dst_port: String,
}

// ── Raw graph ───────────────────────────────────────────────────────────────

/// The validated post-parse graph handed to the checker. Nodes keep their
/// declaration order; edges keep theirs.
#[derive(Debug, Clone)]
pub struct RawGraph {
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, NodeId>,
    edges: Vec<Edge>,
}

impl RawGraph {
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.index()]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&GraphNode> {
        self.by_name.get(name).map(|id| self.node(*id))
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.index()]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Builds a `RawGraph` from a resolved node/edge list, validating each
/// declaration as it arrives.
pub struct GraphBuilder<'r> {
    registry: &'r DescriptorRegistry,
    ids: IdAllocator,
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, NodeId>,
    edges: Vec<Edge>,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r DescriptorRegistry) -> Self {
        GraphBuilder {
            registry,
            ids: IdAllocator::new(),
            nodes: Vec::new(),
            by_name: HashMap::new(),
            edges: Vec::new(),
        }
    }

    fn insert(&mut self, name: String, kind: GraphNodeKind) -> Result<NodeId, GraphError> {
        if self.by_name.contains_key(&name) {
            return Err(GraphError::BadGraphSyntax(format!(
                "node '{}' declared twice",
                name
            )));
        }
        let id = self.ids.alloc_node();
        self.by_name.insert(name.clone(), id);
        self.nodes.push(GraphNode { id, name, kind });
        Ok(id)
    }

    /// Declare a graph input. Produces an input virtual node whose single
    /// output port bears the node's name.
    pub fn add_input(&mut self, name: &str) -> Result<NodeId, GraphError> {
        self.insert(name.to_string(), GraphNodeKind::InputVirtual)
    }

    /// Declare a graph output. Produces an output virtual node whose single
    /// input port bears the node's name.
    pub fn add_output(&mut self, name: &str) -> Result<NodeId, GraphError> {
        self.insert(name.to_string(), GraphNodeKind::OutputVirtual)
    }

    /// Declare a flowunit node.
    pub fn add_node(
        &mut self,
        name: &str,
        flowunit: &str,
        device: DeviceBinding,
    ) -> Result<NodeId, GraphError> {
        if device.device.is_empty() {
            return Err(GraphError::BadGraphSyntax(format!(
                "node '{}' is missing its device binding",
                name
            )));
        }
        let desc = self.registry.get(flowunit, name)?;
        self.insert(name.to_string(), GraphNodeKind::Flowunit { desc, device })
    }

    /// Connect two port-qualified endpoints. Both nodes must already be
    /// declared and both ports must exist on their descriptors.
    pub fn connect(
        &mut self,
        src: &str,
        src_port: &str,
        dst: &str,
        dst_port: &str,
    ) -> Result<EdgeId, GraphError> {
        let src_id = self.lookup(src)?;
        let dst_id = self.lookup(dst)?;

        let src_node = &self.nodes[src_id.index()];
        if !src_node.has_output_port(src_port) {
            return Err(GraphError::UnknownPort {
                node: src.to_string(),
                port: src_port.to_string(),
            });
        }
        let dst_node = &self.nodes[dst_id.index()];
        if !dst_node.has_input_port(dst_port) {
            return Err(GraphError::UnknownPort {
                node: dst.to_string(),
                port: dst_port.to_string(),
            });
        }

        let id = self.ids.alloc_edge();
        self.edges.push(Edge {
            id,
            src: src_id,
            src_port: src_port.to_string(),
            dst: dst_id,
            dst_port: dst_port.to_string(),
        });
        Ok(id)
    }

    /// Connect a graph input to a flowunit port.
    pub fn connect_input(&mut self, input: &str, dst: &str, dst_port: &str) -> Result<EdgeId, GraphError> {
        let port = input.to_string();
        self.connect(input, &port, dst, dst_port)
    }

    /// Connect a flowunit port to a graph output.
    pub fn connect_output(&mut self, src: &str, src_port: &str, output: &str) -> Result<EdgeId, GraphError> {
        let port = output.to_string();
        self.connect(src, src_port, output, &port)
    }

    fn lookup(&self, name: &str) -> Result<NodeId, GraphError> {
        self.by_name.get(name).copied().ok_or_else(|| {
            GraphError::BadGraphSyntax(format!("edge references undeclared node '{}'", name))
        })
    }

    pub fn build(self) -> RawGraph {
        RawGraph {
            nodes: self.nodes,
            by_name: self.by_name,
            edges: self.edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::ErrorKind;

    fn registry() -> DescriptorRegistry {
        let mut r = DescriptorRegistry::new();
        r.register(FlowunitDesc::new(
            "pass",
            &["In_1"],
            &["Out_1"],
            FlowunitCategory::Stream,
        ))
        .unwrap();
        r
    }

    #[test]
    fn linear_graph_builds() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry);
        b.add_input("input1").unwrap();
        b.add_output("output1").unwrap();
        b.add_node("p", "pass", DeviceBinding::cpu()).unwrap();
        b.connect_input("input1", "p", "In_1").unwrap();
        b.connect_output("p", "Out_1", "output1").unwrap();

        let graph = b.build();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edges().len(), 2);
        assert!(graph.node_by_name("p").unwrap().descriptor().is_some());
    }

    #[test]
    fn unknown_port_rejected_at_connect() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry);
        b.add_node("p", "pass", DeviceBinding::cpu()).unwrap();
        b.add_node("q", "pass", DeviceBinding::cpu()).unwrap();
        let err = b.connect("p", "Out_7", "q", "In_1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownPort);
    }

    #[test]
    fn undeclared_node_rejected() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry);
        b.add_node("p", "pass", DeviceBinding::cpu()).unwrap();
        let err = b.connect("p", "Out_1", "ghost", "In_1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadGraphSyntax);
    }

    #[test]
    fn duplicate_node_name_rejected() {
        let registry = registry();
        let mut b = GraphBuilder::new(&registry);
        b.add_node("p", "pass", DeviceBinding::cpu()).unwrap();
        let err = b.add_node("p", "pass", DeviceBinding::cpu()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadGraphSyntax);
    }
}
