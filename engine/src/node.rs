// node.rs — Runtime node instances
//
// A runtime node wraps either a flowunit or one of the virtual node kinds as
// a tagged variant, with `run` dispatched on the tag. Nodes follow a linear
// state machine, Created → Initialized → Opened → Running → Closed; a failed
// open demotes straight to Closed and signals end-of-stream downstream by
// closing its output queues. A node never runs concurrently with itself:
// the flowunit and the per-session accounting sit behind the node's lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

use crate::buffer::{Buffer, FlowunitError, SessionId};
use crate::port::{InPort, OutPort, RuntimeError};
use crate::session::{OutputMap, SessionManager};

// ── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Initialized,
    Opened,
    Running,
    Closed,
}

impl NodeState {
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Initialized => "initialized",
            NodeState::Opened => "opened",
            NodeState::Running => "running",
            NodeState::Closed => "closed",
        }
    }
}

/// Why a scheduling tick fires: data became available, or the engine is
/// draining remaining buffers on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Data,
    Flush,
}

// ── Flowunit boundary ───────────────────────────────────────────────────────

/// Per-node configuration recognised by `Init`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Input queue capacity; `None` is unbounded.
    pub queue_size: Option<usize>,
    /// Override for the external queue of input virtual nodes.
    pub queue_size_external: Option<usize>,
    /// Max buffers handed to the flowunit per invocation and port.
    pub batch_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            queue_size: None,
            queue_size_external: None,
            batch_size: 1,
        }
    }
}

/// One invocation's view of the data: input buffers per port, staged
/// outputs per port.
pub struct ProcessContext<'a> {
    inputs: &'a BTreeMap<String, Vec<Buffer>>,
    staged: HashMap<String, Vec<Buffer>>,
}

impl<'a> ProcessContext<'a> {
    fn new(inputs: &'a BTreeMap<String, Vec<Buffer>>) -> Self {
        ProcessContext {
            inputs,
            staged: HashMap::new(),
        }
    }

    pub fn input(&self, port: &str) -> &[Buffer] {
        self.inputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn inputs(&self) -> &BTreeMap<String, Vec<Buffer>> {
        self.inputs
    }

    /// Stage a buffer for the named output port.
    pub fn emit(&mut self, port: &str, buffer: Buffer) {
        self.staged.entry(port.to_string()).or_default().push(buffer);
    }
}

/// The business-logic boundary. Implementations live outside the engine;
/// tests use passthrough units.
pub trait Flowunit: Send {
    /// Acquire per-node resources.
    fn open(&mut self) -> Result<(), FlowunitError> {
        Ok(())
    }

    /// Process one batch of input buffers, staging outputs on the context.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FlowunitError>;

    /// Release resources. Called on every exit path.
    fn close(&mut self) {}
}

// ── Variants ────────────────────────────────────────────────────────────────

/// Per-session cache of an unmatched output node: buffers grouped by stream
/// under each port, surfaced one stream at a time.
#[derive(Debug, Default)]
struct SessionUnmatchCache {
    port_streams: BTreeMap<String, BTreeMap<u64, Vec<Buffer>>>,
    port_end: BTreeMap<String, bool>,
    last_error: Option<FlowunitError>,
}

impl SessionUnmatchCache {
    fn new(ports: impl Iterator<Item = String>) -> Self {
        let mut cache = SessionUnmatchCache::default();
        for port in ports {
            cache.port_streams.insert(port.clone(), BTreeMap::new());
            cache.port_end.insert(port, false);
        }
        cache
    }

    fn cache_buffer(&mut self, port: &str, buffer: Buffer) {
        if let Some(error) = &buffer.error {
            self.last_error = Some(error.clone());
        }
        if buffer.is_end() {
            self.port_end.insert(port.to_string(), true);
            return;
        }
        self.port_streams
            .entry(port.to_string())
            .or_default()
            .entry(buffer.index.stream.stream)
            .or_default()
            .push(buffer);
    }

    /// Surface the front stream of every port; `None` once all ports are
    /// drained.
    fn pop_cache(&mut self) -> Option<OutputMap> {
        let mut output = OutputMap::new();
        let mut empty_ports = 0;
        for (port, streams) in &mut self.port_streams {
            match streams.pop_first() {
                Some((_, buffers)) => {
                    let valid = buffers
                        .into_iter()
                        .filter(|b| !b.is_end() && !b.is_placeholder())
                        .collect();
                    output.insert(port.clone(), valid);
                }
                None => {
                    output.insert(port.clone(), Vec::new());
                    empty_ports += 1;
                }
            }
        }
        if empty_ports == self.port_streams.len() {
            return None;
        }
        Some(output)
    }

    fn all_ports_end(&self) -> bool {
        self.port_end.values().all(|end| *end)
    }
}

/// What a runtime node is. Each variant holds only its own state.
enum NodeRole {
    Flowunit {
        unit: Mutex<Box<dyn Flowunit>>,
        /// Ports that saw an end marker, per session.
        ends: Mutex<HashMap<SessionId, BTreeSet<String>>>,
    },
    InputVirtual {
        extern_rx: Receiver<Buffer>,
    },
    OutputVirtual {
        ends: Mutex<HashMap<SessionId, BTreeSet<String>>>,
    },
    OutputUnmatchVirtual {
        caches: Mutex<HashMap<SessionId, SessionUnmatchCache>>,
    },
}

// ── Runtime node ────────────────────────────────────────────────────────────

pub struct RuntimeNode {
    name: String,
    config: NodeConfig,
    state: Mutex<NodeState>,
    role: NodeRole,
    in_ports: Vec<InPort>,
    out_ports: Mutex<Vec<OutPort>>,
    match_ref: Mutex<Weak<RuntimeNode>>,
    sessions: Arc<SessionManager>,
}

impl RuntimeNode {
    fn new(
        name: String,
        config: NodeConfig,
        role: NodeRole,
        in_ports: Vec<InPort>,
        out_ports: Vec<OutPort>,
        sessions: Arc<SessionManager>,
    ) -> RuntimeNode {
        RuntimeNode {
            name,
            config,
            state: Mutex::new(NodeState::Created),
            role,
            in_ports,
            out_ports: Mutex::new(out_ports),
            match_ref: Mutex::new(Weak::new()),
            sessions,
        }
    }

    pub(crate) fn flowunit(
        name: String,
        config: NodeConfig,
        unit: Box<dyn Flowunit>,
        in_ports: Vec<InPort>,
        out_ports: Vec<OutPort>,
        sessions: Arc<SessionManager>,
    ) -> RuntimeNode {
        RuntimeNode::new(
            name,
            config,
            NodeRole::Flowunit {
                unit: Mutex::new(unit),
                ends: Mutex::new(HashMap::new()),
            },
            in_ports,
            out_ports,
            sessions,
        )
    }

    pub(crate) fn input_virtual(
        name: String,
        config: NodeConfig,
        extern_rx: Receiver<Buffer>,
        out_ports: Vec<OutPort>,
        sessions: Arc<SessionManager>,
    ) -> RuntimeNode {
        RuntimeNode::new(
            name,
            config,
            NodeRole::InputVirtual { extern_rx },
            Vec::new(),
            out_ports,
            sessions,
        )
    }

    pub(crate) fn output_virtual(
        name: String,
        config: NodeConfig,
        unmatched: bool,
        in_ports: Vec<InPort>,
        sessions: Arc<SessionManager>,
    ) -> RuntimeNode {
        let role = if unmatched {
            NodeRole::OutputUnmatchVirtual {
                caches: Mutex::new(HashMap::new()),
            }
        } else {
            NodeRole::OutputVirtual {
                ends: Mutex::new(HashMap::new()),
            }
        };
        RuntimeNode::new(name, config, role, in_ports, Vec::new(), sessions)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().expect("node state lock")
    }

    pub(crate) fn set_match(&self, target: &Arc<RuntimeNode>) {
        *self.match_ref.lock().expect("node match lock") = Arc::downgrade(target);
    }

    /// The runtime instance of this node's match node, if any.
    pub fn match_node(&self) -> Option<Arc<RuntimeNode>> {
        self.match_ref.lock().expect("node match lock").upgrade()
    }

    pub fn is_virtual(&self) -> bool {
        !matches!(self.role, NodeRole::Flowunit { .. })
    }

    /// True for the cache-based unmatched output variant.
    pub fn is_unmatch_output(&self) -> bool {
        matches!(self.role, NodeRole::OutputUnmatchVirtual { .. })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Ports are wired; the node may now be opened. Called by the assembler
    /// once construction of the whole graph is complete.
    pub(crate) fn init(&self) {
        let mut state = self.state.lock().expect("node state lock");
        if *state == NodeState::Created {
            *state = NodeState::Initialized;
        }
    }

    /// Acquire per-node resources. A flowunit open failure demotes the node
    /// to Closed and closes its output queues, which downstream consumers
    /// observe as end-of-stream.
    pub fn open(&self) -> Result<(), RuntimeError> {
        {
            let state = self.state.lock().expect("node state lock");
            if *state != NodeState::Initialized {
                return Err(RuntimeError::BadState {
                    node: self.name.clone(),
                    state: state.name(),
                    expected: NodeState::Initialized.name(),
                });
            }
        }

        if let NodeRole::Flowunit { unit, .. } = &self.role {
            let result = unit.lock().expect("flowunit lock").open();
            if let Err(error) = result {
                warn!(node = %self.name, %error, "open failed, closing node");
                self.close();
                return Err(error.into());
            }
        }
        *self.state.lock().expect("node state lock") = NodeState::Opened;
        Ok(())
    }

    /// Release resources. Legal from any state; idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("node state lock");
        if *state == NodeState::Closed {
            return;
        }
        *state = NodeState::Closed;
        drop(state);

        if let NodeRole::Flowunit { unit, .. } = &self.role {
            unit.lock().expect("flowunit lock").close();
        }
        for port in self.out_ports.lock().expect("node ports lock").iter_mut() {
            port.close();
        }
        debug!(node = %self.name, "closed");
    }

    /// One scheduling tick. Returns whether any buffer moved.
    pub fn run(&self, run_type: RunType) -> Result<bool, RuntimeError> {
        {
            let mut state = self.state.lock().expect("node state lock");
            match *state {
                NodeState::Opened => *state = NodeState::Running,
                NodeState::Running => {}
                NodeState::Closed => return Ok(false),
                other => {
                    return Err(RuntimeError::BadState {
                        node: self.name.clone(),
                        state: other.name(),
                        expected: NodeState::Opened.name(),
                    })
                }
            }
        }

        match &self.role {
            NodeRole::Flowunit { unit, ends } => self.run_flowunit(run_type, unit, ends),
            NodeRole::InputVirtual { extern_rx } => self.run_input_virtual(extern_rx),
            NodeRole::OutputVirtual { ends } => self.run_output_virtual(ends),
            NodeRole::OutputUnmatchVirtual { caches } => self.run_output_unmatch(caches),
        }
    }

    // ── Tick bodies ─────────────────────────────────────────────────────

    fn aborted(&self, buffer: &Buffer) -> bool {
        self.sessions
            .get(&buffer.index.stream.session)
            .map(|s| s.is_abort())
            .unwrap_or(false)
    }

    fn record_error(&self, buffer: &Buffer) {
        if let (Some(error), Some(session)) = (
            &buffer.error,
            self.sessions.get(&buffer.index.stream.session),
        ) {
            session.set_error(error.clone());
        }
    }

    fn run_flowunit(
        &self,
        _run_type: RunType,
        unit: &Mutex<Box<dyn Flowunit>>,
        ends: &Mutex<HashMap<SessionId, BTreeSet<String>>>,
    ) -> Result<bool, RuntimeError> {
        let batch = Some(self.config.batch_size);
        let mut inputs: BTreeMap<String, Vec<Buffer>> = BTreeMap::new();
        let mut passthrough: Vec<Buffer> = Vec::new();
        let mut consumed = 0usize;

        for port in &self.in_ports {
            let mut data = Vec::new();
            for buffer in port.recv_batch(batch) {
                consumed += 1;
                if self.aborted(&buffer) {
                    continue;
                }
                if buffer.has_error() {
                    // Record and forward without processing so end flags and
                    // the error itself keep moving downstream.
                    self.record_error(&buffer);
                    passthrough.push(buffer);
                    continue;
                }
                if buffer.is_end() {
                    let mut ends = ends.lock().expect("node ends lock");
                    let session = buffer.index.stream.session.clone();
                    let seen = ends.entry(session.clone()).or_default();
                    seen.insert(port.name().to_string());
                    if seen.len() == self.in_ports.len() {
                        ends.remove(&session);
                        passthrough.push(buffer);
                    }
                    continue;
                }
                data.push(buffer);
            }
            if !data.is_empty() {
                inputs.insert(port.name().to_string(), data);
            }
        }

        let has_inputs = !self.in_ports.is_empty();
        if has_inputs && inputs.is_empty() && passthrough.is_empty() {
            return Ok(consumed > 0);
        }

        let mut staged = HashMap::new();
        if !inputs.is_empty() || !has_inputs {
            let mut ctx = ProcessContext::new(&inputs);
            match unit.lock().expect("flowunit lock").process(&mut ctx) {
                Ok(()) => staged = ctx.staged,
                Err(error) => {
                    // Attach the error to the stream in-band; the session
                    // keeps draining so end flags still propagate.
                    warn!(node = %self.name, %error, "process failed");
                    if let Some(first) = inputs.values().flatten().next() {
                        let errored = first.derive(Vec::new()).with_error(error.clone());
                        self.record_error(&errored);
                        passthrough.push(errored);
                    }
                }
            }
        }

        let out_ports = self.out_ports.lock().expect("node ports lock");
        let mut moved = consumed > 0;
        for port in out_ports.iter() {
            if let Some(buffers) = staged.remove(port.name()) {
                for buffer in buffers {
                    port.send(buffer);
                    moved = true;
                }
            }
            for buffer in &passthrough {
                port.send(buffer.clone());
                moved = true;
            }
        }
        Ok(moved)
    }

    fn run_input_virtual(&self, extern_rx: &Receiver<Buffer>) -> Result<bool, RuntimeError> {
        // Externally pushed data already carries its index info; forward it.
        let mut moved = false;
        let out_ports = self.out_ports.lock().expect("node ports lock");
        while let Ok(buffer) = extern_rx.try_recv() {
            moved = true;
            if self.aborted(&buffer) && !buffer.is_end() {
                continue;
            }
            for port in out_ports.iter() {
                port.send(buffer.clone());
            }
        }
        Ok(moved)
    }

    fn run_output_virtual(
        &self,
        ends: &Mutex<HashMap<SessionId, BTreeSet<String>>>,
    ) -> Result<bool, RuntimeError> {
        let mut moved = false;
        let mut surfaced: HashMap<SessionId, OutputMap> = HashMap::new();
        let mut errors: HashMap<SessionId, FlowunitError> = HashMap::new();
        let mut finished: Vec<SessionId> = Vec::new();

        for port in &self.in_ports {
            for buffer in port.recv_batch(None) {
                moved = true;
                let session_id = buffer.index.stream.session.clone();
                if self.aborted(&buffer) {
                    continue;
                }
                if let Some(error) = &buffer.error {
                    errors.insert(session_id.clone(), error.clone());
                }
                if buffer.is_end() {
                    let mut ends = ends.lock().expect("node ends lock");
                    let seen = ends.entry(session_id.clone()).or_default();
                    seen.insert(port.name().to_string());
                    if seen.len() == self.in_ports.len() {
                        ends.remove(&session_id);
                        finished.push(session_id);
                    }
                    continue;
                }
                if buffer.is_placeholder() {
                    continue;
                }
                surfaced
                    .entry(session_id)
                    .or_default()
                    .entry(port.name().to_string())
                    .or_default()
                    .push(buffer);
            }
        }

        for (session_id, output) in surfaced {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            if session.is_abort() {
                continue;
            }
            // The caller may have released the handle; then there is nobody
            // to surface to.
            let Some(io) = session.io() else { continue };
            io.set_last_error(errors.remove(&session_id));
            io.push_output(output);
        }

        for session_id in finished {
            let Some(session) = self.sessions.get(&session_id) else {
                continue;
            };
            let io = session.io();
            if let Some(io) = &io {
                io.set_last_error(errors.remove(&session_id));
            }
            // Another output may still be draining this session.
            if !session.output_done() {
                continue;
            }
            if let Some(io) = &io {
                io.finish();
            }
            session.close();
            debug!(node = %self.name, session = %session_id, "session processed over");
            self.sessions.delete_session(&session_id);
        }
        Ok(moved)
    }

    fn run_output_unmatch(
        &self,
        caches: &Mutex<HashMap<SessionId, SessionUnmatchCache>>,
    ) -> Result<bool, RuntimeError> {
        let mut moved = false;
        let mut caches = caches.lock().expect("node cache lock");

        for port in &self.in_ports {
            for buffer in port.recv_batch(None) {
                moved = true;
                let session_id = buffer.index.stream.session.clone();
                if self.aborted(&buffer) {
                    continue;
                }
                let cache = caches.entry(session_id).or_insert_with(|| {
                    SessionUnmatchCache::new(
                        self.in_ports.iter().map(|p| p.name().to_string()),
                    )
                });
                cache.cache_buffer(port.name(), buffer);
            }
        }

        caches.retain(|session_id, cache| {
            let session = self.sessions.get(session_id);
            let io = session.as_ref().and_then(|s| s.io());
            if let Some(io) = &io {
                io.set_last_error(cache.last_error.take());
                while let Some(output) = cache.pop_cache() {
                    io.push_output(output);
                }
            }
            let aborted = session.as_ref().map(|s| s.is_abort()).unwrap_or(true);
            if !cache.all_ports_end() && !aborted {
                return true;
            }
            // This node is done with the session; tear it down only once
            // every other output has drained it too.
            let last_output = session
                .as_ref()
                .map(|s| s.output_done())
                .unwrap_or(false);
            if last_output {
                if let Some(io) = &io {
                    io.finish();
                }
                if let Some(session) = &session {
                    session.close();
                }
                debug!(node = %self.name, session = %session_id, "session processed over");
                self.sessions.delete_session(session_id);
            }
            false
        });
        Ok(moved)
    }
}
