// assemble.rs — Executable graph assembler
//
// Freezes a validated graph into runtime node instances: one input queue per
// input port (shared by all edges targeting it), one sender per edge on the
// producing side, and the match pointer computed by the checker attached to
// each node. Iteration order is the raw graph's insertion order, so assembly
// is deterministic.
//
// The work-stealing scheduler lives outside the engine; `run_until_idle` is
// a deterministic single-threaded pump over the topological order, enough to
// drive a session end-to-end for embedders and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::buffer::Buffer;
use crate::checker::CheckedGraph;
use crate::graph::GraphNode;
use crate::id::NodeId;
use crate::node::{Flowunit, NodeConfig, RunType, RuntimeNode};
use crate::port::{queue, InPort, OutPort, RuntimeError};
use crate::session::{SessionIo, SessionManager};

// ── Options and provider ────────────────────────────────────────────────────

/// Flowunit instantiation boundary: the assembler asks the provider for the
/// business logic of each flowunit node.
pub trait FlowunitProvider {
    fn create(&self, node: &GraphNode) -> Box<dyn Flowunit>;
}

impl<F> FlowunitProvider for F
where
    F: Fn(&GraphNode) -> Box<dyn Flowunit>,
{
    fn create(&self, node: &GraphNode) -> Box<dyn Flowunit> {
        self(node)
    }
}

/// Assembly configuration: a default node config plus per-node overrides.
#[derive(Debug, Clone, Default)]
pub struct AssembleOptions {
    pub default: NodeConfig,
    pub per_node: HashMap<String, NodeConfig>,
}

impl AssembleOptions {
    fn config_for(&self, name: &str) -> NodeConfig {
        self.per_node.get(name).cloned().unwrap_or_else(|| self.default.clone())
    }
}

// ── Executable graph ────────────────────────────────────────────────────────

/// The frozen runtime graph. Immutable wiring; nodes carry all mutable
/// state behind their own locks.
pub struct ExecutableGraph {
    nodes: Vec<Arc<RuntimeNode>>,
    by_name: HashMap<String, usize>,
    topo: Vec<usize>,
    sessions: Arc<SessionManager>,
    extern_inputs: HashMap<String, Sender<Buffer>>,
    output_count: usize,
}

impl ExecutableGraph {
    /// Materialise runtime nodes for a validated graph.
    pub fn assemble(
        checked: &CheckedGraph,
        provider: &dyn FlowunitProvider,
        options: &AssembleOptions,
    ) -> ExecutableGraph {
        let graph = checked.graph();
        let resolution = checked.resolution();
        let sessions = Arc::new(SessionManager::new());

        // Input queues first: one per input port, shared by all its edges.
        let mut port_tx: HashMap<(usize, String), Sender<Buffer>> = HashMap::new();
        let mut port_rx = HashMap::new();
        for node in graph.nodes() {
            let config = options.config_for(&node.name);
            for port in node.input_ports() {
                let (tx, rx) = queue(config.queue_size);
                port_tx.insert((node.id.index(), port.to_string()), tx);
                port_rx.insert((node.id.index(), port.to_string()), rx);
            }
        }

        // Producer side: one sender per edge, in edge declaration order.
        let mut out_senders: HashMap<(usize, String), Vec<Sender<Buffer>>> = HashMap::new();
        for edge in graph.edges() {
            let tx = port_tx[&(edge.dst.index(), edge.dst_port.clone())].clone();
            out_senders
                .entry((edge.src.index(), edge.src_port.clone()))
                .or_default()
                .push(tx);
        }

        // Each graph output is decided on its own: when the producers
        // feeding that one output disagree on their match node, it takes
        // the cache-based unmatched variant. Other outputs are unaffected.
        let mut output_matches: HashMap<NodeId, Vec<Option<NodeId>>> = HashMap::new();
        for edge in graph.edges() {
            if graph.node(edge.dst).is_output_virtual() {
                output_matches
                    .entry(edge.dst)
                    .or_default()
                    .push(resolution.match_node(edge.src));
            }
        }
        let unmatched_outputs: HashSet<NodeId> = output_matches
            .into_iter()
            .filter_map(|(output, mut matches)| {
                matches.sort();
                matches.dedup();
                (matches.len() > 1).then_some(output)
            })
            .collect();
        let output_count = graph
            .nodes()
            .iter()
            .filter(|n| n.is_output_virtual())
            .count();

        let mut nodes = Vec::with_capacity(graph.node_count());
        let mut by_name = HashMap::new();
        let mut extern_inputs = HashMap::new();

        for node in graph.nodes() {
            let config = options.config_for(&node.name);
            let out_ports: Vec<OutPort> = node
                .output_ports()
                .iter()
                .map(|port| {
                    OutPort::new(
                        *port,
                        out_senders
                            .remove(&(node.id.index(), port.to_string()))
                            .unwrap_or_default(),
                    )
                })
                .collect();
            let in_ports: Vec<InPort> = node
                .input_ports()
                .iter()
                .map(|port| {
                    InPort::new(
                        *port,
                        port_rx
                            .remove(&(node.id.index(), port.to_string()))
                            .expect("queue created for every input port"),
                    )
                })
                .collect();

            let runtime = if node.is_input_virtual() {
                let capacity = config.queue_size_external.or(config.queue_size);
                let (tx, rx) = queue(capacity);
                extern_inputs.insert(node.name.clone(), tx);
                RuntimeNode::input_virtual(
                    node.name.clone(),
                    config,
                    rx,
                    out_ports,
                    sessions.clone(),
                )
            } else if node.is_output_virtual() {
                RuntimeNode::output_virtual(
                    node.name.clone(),
                    config,
                    unmatched_outputs.contains(&node.id),
                    in_ports,
                    sessions.clone(),
                )
            } else {
                RuntimeNode::flowunit(
                    node.name.clone(),
                    config,
                    provider.create(node),
                    in_ports,
                    out_ports,
                    sessions.clone(),
                )
            };

            by_name.insert(node.name.clone(), nodes.len());
            nodes.push(Arc::new(runtime));
        }

        // Attach the checker's match pointers, then mark nodes initialized.
        for node in graph.nodes() {
            if let Some(match_id) = resolution.match_node(node.id) {
                let target = &nodes[match_id.index()];
                nodes[node.id.index()].set_match(target);
            }
        }
        for node in &nodes {
            node.init();
        }

        let topo = resolution
            .topo_order()
            .iter()
            .map(|id| id.index())
            .collect();

        info!(nodes = nodes.len(), "graph assembled");
        ExecutableGraph {
            nodes,
            by_name,
            topo,
            sessions,
            extern_inputs,
            output_count,
        }
    }

    pub fn get_node(&self, name: &str) -> Option<&Arc<RuntimeNode>> {
        self.by_name.get(name).map(|idx| &self.nodes[*idx])
    }

    pub fn nodes(&self) -> &[Arc<RuntimeNode>] {
        &self.nodes
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Open every node. A failed open closes that node (its downstream
    /// queues observe end-of-stream) and the error is returned.
    pub fn open_all(&self) -> Result<(), RuntimeError> {
        let mut first_error = None;
        for idx in &self.topo {
            if let Err(error) = self.nodes[*idx].open() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Close every node, draining order first.
    pub fn close_all(&self) {
        for idx in &self.topo {
            self.nodes[*idx].close();
        }
    }

    /// Start one session against this graph. The session ends once every
    /// graph output has drained it.
    pub fn create_session(&self) -> Arc<SessionIo> {
        let session = self.sessions.create_session();
        session.set_pending_outputs(self.output_count);
        SessionIo::new(session, self.extern_inputs.clone())
    }

    /// Deterministic single-threaded pump: tick nodes in topological order
    /// until a full pass moves no buffer. Meant for unbounded queues; a
    /// bounded producer blocking on a full queue needs a concurrent
    /// scheduler instead.
    pub fn run_until_idle(&self) -> Result<(), RuntimeError> {
        loop {
            let mut moved = false;
            for idx in &self.topo {
                moved |= self.nodes[*idx].run(RunType::Data)?;
            }
            if !moved {
                debug!("graph idle");
                return Ok(());
            }
        }
    }
}
