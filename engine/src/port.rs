// port.rs — Runtime ports over buffer queues
//
// Input queues are the synchronization boundary between runtime nodes:
// producers push, consumers pop, and a bounded queue exerts backpressure by
// blocking the producer until space frees up. A port with several incoming
// edges shares one queue with one sender per edge; fan-out clones the buffer
// (payloads are shared `Arc` slices, so clones are cheap).

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::buffer::{Buffer, FlowunitError};

/// Errors surfaced by the runtime boundary (ports, sessions, node ticks).
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("unknown port '{0}'")]
    UnknownPort(String),

    #[error("session '{0}' is closed")]
    SessionClosed(String),

    #[error("node '{node}' is in state {state}, expected {expected}")]
    BadState {
        node: String,
        state: &'static str,
        expected: &'static str,
    },

    #[error(transparent)]
    Flowunit(#[from] FlowunitError),
}

/// Create one buffer queue. `capacity` of `None` means unbounded.
pub fn queue(capacity: Option<usize>) -> (Sender<Buffer>, Receiver<Buffer>) {
    match capacity {
        Some(n) => bounded(n),
        None => unbounded(),
    }
}

// ── Input side ──────────────────────────────────────────────────────────────

/// Receiving end of one input port's queue.
#[derive(Debug)]
pub struct InPort {
    name: String,
    rx: Receiver<Buffer>,
}

impl InPort {
    pub fn new(name: impl Into<String>, rx: Receiver<Buffer>) -> Self {
        InPort {
            name: name.into(),
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffers currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Pop up to `max` buffers without blocking; `None` means all currently
    /// available.
    pub fn recv_batch(&self, max: Option<usize>) -> Vec<Buffer> {
        let limit = max.unwrap_or(usize::MAX);
        let mut batch = Vec::new();
        while batch.len() < limit {
            match self.rx.try_recv() {
                Ok(buffer) => batch.push(buffer),
                Err(_) => break,
            }
        }
        batch
    }
}

// ── Output side ─────────────────────────────────────────────────────────────

/// Sending end of one output port: one sender per downstream edge.
#[derive(Debug)]
pub struct OutPort {
    name: String,
    txs: Vec<Sender<Buffer>>,
}

impl OutPort {
    pub fn new(name: impl Into<String>, txs: Vec<Sender<Buffer>>) -> Self {
        OutPort {
            name: name.into(),
            txs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        !self.txs.is_empty()
    }

    /// Send to every downstream queue. Blocks on a full bounded queue;
    /// disconnected consumers (already closed nodes) are skipped.
    pub fn send(&self, buffer: Buffer) {
        for tx in &self.txs {
            let _ = tx.send(buffer.clone());
        }
    }

    /// Send without blocking. Returns the buffer if any queue is full.
    pub fn try_send(&self, buffer: Buffer) -> Result<(), Buffer> {
        for tx in &self.txs {
            match tx.try_send(buffer.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(b)) => return Err(b),
            }
        }
        Ok(())
    }

    /// Drop the senders, closing every downstream queue.
    pub fn close(&mut self) {
        self.txs.clear();
    }
}
