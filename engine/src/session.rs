// session.rs — Sessions and the external I/O handle
//
// A session is the end-to-end execution context for one invocation of the
// graph: it owns its buffers' identity, its abort/close flags, and the last
// error observed while processing its data. The session manager keeps weak
// references only, so a session lives exactly as long as its users and
// in-flight buffers need it. The I/O handle is held by the external caller;
// output nodes reach it through the session and silently drop data once the
// caller releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::debug;

use crate::buffer::{Buffer, FlowunitError, IndexInfo, SessionId, StreamId};
use crate::port::RuntimeError;

/// Buffers surfaced to the caller, keyed by graph output name.
pub type OutputMap = HashMap<String, Vec<Buffer>>;

// ── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    closed: AtomicBool,
    aborted: AtomicBool,
    error: Mutex<Option<FlowunitError>>,
    io: Mutex<Weak<SessionIoShared>>,
    /// Output virtual nodes that have not yet drained this session.
    pending_outputs: AtomicUsize,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Session {
            id,
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
            io: Mutex::new(Weak::new()),
            pending_outputs: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Soft end: current data drains, then the session ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Immediate end: nodes observing the flag drop remaining buffers.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_abort(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Record an error observed on this session's data. The most recent
    /// error wins; readers see it as `last_error`.
    pub fn set_error(&self, error: FlowunitError) {
        *self.error.lock().expect("session error lock") = Some(error);
    }

    pub fn last_error(&self) -> Option<FlowunitError> {
        self.error.lock().expect("session error lock").clone()
    }

    pub(crate) fn set_pending_outputs(&self, count: usize) {
        self.pending_outputs.store(count, Ordering::Release);
    }

    /// One output virtual node finished draining this session. True when it
    /// was the last one, i.e. the session may now tear down.
    pub(crate) fn output_done(&self) -> bool {
        self.pending_outputs.fetch_sub(1, Ordering::AcqRel) <= 1
    }

    pub(crate) fn bind_io(&self, shared: &Arc<SessionIoShared>) {
        *self.io.lock().expect("session io lock") = Arc::downgrade(shared);
    }

    /// The I/O handle, if the external caller still holds it.
    pub(crate) fn io(&self) -> Option<Arc<SessionIoShared>> {
        self.io.lock().expect("session io lock").upgrade()
    }
}

// ── Session manager ─────────────────────────────────────────────────────────

/// Lock-protected mapping `session id → weak session`, with entries removed
/// on teardown.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Weak<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&self) -> Arc<Session> {
        let id = format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id.clone()));
        self.sessions
            .lock()
            .expect("session map lock")
            .insert(id.clone(), Arc::downgrade(&session));
        debug!(session = %id, "session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session map lock")
            .get(id)
            .and_then(Weak::upgrade)
    }

    pub fn delete_session(&self, id: &str) {
        if self
            .sessions
            .lock()
            .expect("session map lock")
            .remove(id)
            .is_some()
        {
            debug!(session = %id, "session removed");
        }
    }

    /// Live sessions; dead entries are pruned on the way.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut map = self.sessions.lock().expect("session map lock");
        map.retain(|_, weak| weak.strong_count() > 0);
        map.values().filter_map(Weak::upgrade).collect()
    }
}

// ── External I/O handle ─────────────────────────────────────────────────────

/// State shared between the caller's handle and the output virtual nodes.
#[derive(Debug)]
pub(crate) struct SessionIoShared {
    output_tx: Sender<OutputMap>,
    finished: AtomicBool,
    last_error: Mutex<Option<FlowunitError>>,
}

impl SessionIoShared {
    pub(crate) fn push_output(&self, output: OutputMap) {
        let _ = self.output_tx.send(output);
    }

    pub(crate) fn set_last_error(&self, error: Option<FlowunitError>) {
        if let Some(error) = error {
            *self.last_error.lock().expect("io error lock") = Some(error);
        }
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Result of draining graph outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum RecvResult {
    Ok(OutputMap),
    NoData,
    Timeout,
}

/// The caller's handle for one session: pushes buffers into the graph's
/// input virtual nodes and drains results surfaced by the output virtual
/// nodes.
#[derive(Debug)]
pub struct SessionIo {
    session: Arc<Session>,
    shared: Arc<SessionIoShared>,
    output_rx: Receiver<OutputMap>,
    inputs: HashMap<String, Sender<Buffer>>,
    streams: HashMap<String, u64>,
    positions: Mutex<HashMap<String, u64>>,
}

impl SessionIo {
    pub(crate) fn new(
        session: Arc<Session>,
        inputs: HashMap<String, Sender<Buffer>>,
    ) -> Arc<SessionIo> {
        let (output_tx, output_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(SessionIoShared {
            output_tx,
            finished: AtomicBool::new(false),
            last_error: Mutex::new(None),
        });
        session.bind_io(&shared);

        // One root stream per graph input, numbered in name order.
        let mut names: Vec<&String> = inputs.keys().collect();
        names.sort();
        let streams = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u64))
            .collect();

        Arc::new(SessionIo {
            session,
            shared,
            output_rx,
            inputs,
            streams,
            positions: Mutex::new(HashMap::new()),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Enqueue one buffer on the named graph input.
    pub fn push_data(
        &self,
        port: &str,
        payload: impl Into<Arc<[u8]>>,
        meta: Option<HashMap<String, String>>,
    ) -> Result<(), RuntimeError> {
        if self.session.is_closed() || self.session.is_abort() {
            return Err(RuntimeError::SessionClosed(self.session.id().clone()));
        }
        let tx = self
            .inputs
            .get(port)
            .ok_or_else(|| RuntimeError::UnknownPort(port.to_string()))?;

        let stream = StreamId {
            session: self.session.id().clone(),
            stream: self.streams[port],
        };
        let position = {
            let mut positions = self.positions.lock().expect("io position lock");
            let slot = positions.entry(port.to_string()).or_insert(0);
            let position = *slot;
            *slot += 1;
            position
        };

        let mut buffer = Buffer::new(payload, IndexInfo::new(stream, position));
        if let Some(meta) = meta {
            buffer = buffer.with_meta(meta);
        }
        tx.send(buffer)
            .map_err(|_| RuntimeError::SessionClosed(self.session.id().clone()))
    }

    /// Signal end-of-stream on every graph input and close the session.
    pub fn close(&self) {
        if self.session.is_closed() {
            return;
        }
        let mut positions = self.positions.lock().expect("io position lock");
        for (port, tx) in &self.inputs {
            let position = positions.entry(port.clone()).or_insert(0);
            let stream = StreamId {
                session: self.session.id().clone(),
                stream: self.streams[port],
            };
            let _ = tx.send(Buffer::end_marker(stream, *position));
            *position += 1;
        }
        self.session.close();
    }

    /// Abort the session immediately; in-flight buffers are dropped by the
    /// nodes that observe the flag.
    pub fn abort(&self) {
        self.session.abort();
    }

    /// Drain one batch of results. `timeout` of `None` blocks until data or
    /// end of session.
    pub fn recv(&self, timeout: Option<Duration>) -> RecvResult {
        match self.output_rx.try_recv() {
            Ok(map) => return RecvResult::Ok(map),
            Err(TryRecvError::Disconnected) => return RecvResult::NoData,
            Err(TryRecvError::Empty) => {}
        }
        if self.shared.finished.load(Ordering::Acquire) {
            return RecvResult::NoData;
        }
        match timeout {
            None => match self.output_rx.recv() {
                Ok(map) => RecvResult::Ok(map),
                Err(_) => RecvResult::NoData,
            },
            Some(timeout) => match self.output_rx.recv_timeout(timeout) {
                Ok(map) => RecvResult::Ok(map),
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.finished.load(Ordering::Acquire) {
                        RecvResult::NoData
                    } else {
                        RecvResult::Timeout
                    }
                }
                Err(RecvTimeoutError::Disconnected) => RecvResult::NoData,
            },
        }
    }

    /// The last error recorded while processing this session's data.
    pub fn last_error(&self) -> Option<FlowunitError> {
        self.shared
            .last_error
            .lock()
            .expect("io error lock")
            .clone()
            .or_else(|| self.session.last_error())
    }
}
