// buffer.rs — Data units flowing on edges
//
// A buffer carries an opaque payload plus the index information the engine
// uses to pair inputs across ports of a match node: stream identity,
// position within the stream, and the end/placeholder flags. Buffers may
// also carry a flowunit error, which downstream nodes record on the session
// while continuing to drain so end flags propagate.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// End-to-end execution context identity. Sessions own their buffers.
pub type SessionId = String;

/// Identity of one totally-ordered buffer lineage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub session: SessionId,
    pub stream: u64,
}

/// Pairing metadata carried by every buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub stream: StreamId,
    pub position: u64,
    /// Marks the end of the stream; carries no payload.
    pub end_flag: bool,
    /// Keeps pairing positions aligned across branches that produced no data.
    pub placeholder: bool,
}

impl IndexInfo {
    pub fn new(stream: StreamId, position: u64) -> Self {
        IndexInfo {
            stream,
            position,
            end_flag: false,
            placeholder: false,
        }
    }
}

/// An error raised by a flowunit, attached to buffers for in-band
/// propagation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flowunit '{node}' failed: {message}")]
pub struct FlowunitError {
    pub node: String,
    pub message: String,
}

impl FlowunitError {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        FlowunitError {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// One data unit on an edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub payload: Arc<[u8]>,
    pub meta: Option<Arc<HashMap<String, String>>>,
    pub index: IndexInfo,
    pub error: Option<FlowunitError>,
}

impl Buffer {
    pub fn new(payload: impl Into<Arc<[u8]>>, index: IndexInfo) -> Self {
        Buffer {
            payload: payload.into(),
            meta: None,
            index,
            error: None,
        }
    }

    pub fn with_meta(mut self, meta: HashMap<String, String>) -> Self {
        self.meta = Some(Arc::new(meta));
        self
    }

    pub fn with_error(mut self, error: FlowunitError) -> Self {
        self.error = Some(error);
        self
    }

    /// An end-of-stream marker at `position`.
    pub fn end_marker(stream: StreamId, position: u64) -> Self {
        let mut index = IndexInfo::new(stream, position);
        index.end_flag = true;
        Buffer {
            payload: Arc::from(Vec::new()),
            meta: None,
            index,
            error: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.index.end_flag
    }

    pub fn is_placeholder(&self) -> bool {
        self.index.placeholder
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// A derived buffer on the same stream position with a new payload.
    pub fn derive(&self, payload: impl Into<Arc<[u8]>>) -> Self {
        Buffer {
            payload: payload.into(),
            meta: self.meta.clone(),
            index: self.index.clone(),
            error: self.error.clone(),
        }
    }
}
