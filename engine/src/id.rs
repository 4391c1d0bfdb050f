// id.rs — Stable identifiers for graph entities
//
// Node and edge IDs are allocated in declaration order by the graph builder,
// giving deterministic identity independent of map iteration order. IDs index
// directly into the raw graph's node/edge vectors.

/// Stable identifier for a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable identifier for a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocator for graph IDs. Produces monotonically increasing IDs in
/// declaration order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_node: u32,
    next_edge: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn alloc_edge(&mut self) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        id
    }
}
