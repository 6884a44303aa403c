//! Stable identifiers for graphs, nodes and device resources.
//!
//! All IDs are distinct newtype wrappers, so a `NodeId` cannot be used where
//! an `EventHandle` is expected. Node identity is `(graph, slot, generation)`:
//! the slot is the petgraph index, the generation is bumped whenever the slot
//! is vacated, which makes a handle to a removed node detectable even after
//! its slot has been reused.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::arena::Key;

static NEXT_GRAPH_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique graph identity. Clones receive a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub u32);

impl GraphId {
    pub(crate) fn fresh() -> Self {
        GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a node inside a specific [`Graph`](crate::graph::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Graph the node belongs to.
    pub graph: GraphId,
    /// Slot inside the graph's node storage.
    pub slot: u32,
    /// Generation of the slot at the time the node was created.
    pub generation: u32,
}

impl NodeId {
    /// The petgraph index backing this node.
    pub fn index(&self) -> NodeIndex<u32> {
        NodeIndex::new(self.slot as usize)
    }
}

/// Opaque kernel entry point, handed out by the kernel loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionHandle(pub Key);

/// Opaque event handle, handed out by the event provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventHandle(pub Key);

/// Opaque semaphore handle, handed out by the semaphore provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemaphoreHandle(pub Key);

/// Context a queue is bound to. Owned by the device provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextHandle(pub u32);

/// Device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceOrdinal(pub u32);

/// A device (or host-pinned) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// Returns the address `bytes` past this one, saturating at the top of
    /// the address space.
    pub fn offset(self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0.saturating_add(bytes))
    }

    /// Returns the address `bytes` past this one, or `None` on overflow.
    pub fn checked_offset(self, bytes: u64) -> Option<DevicePtr> {
        self.0.checked_add(bytes).map(DevicePtr)
    }
}

/// Where a piece of memory lives. Copy and set nodes must keep their memory
/// spaces across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    Host,
    Device(DeviceOrdinal),
}

/// Reference to an external resource a node depends on, used for liveness
/// checks at instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceRef {
    Function(FunctionHandle),
    Event(EventHandle),
    Semaphore(SemaphoreHandle),
}

// Display implementations.

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/n{}v{}", self.graph, self.slot, self.generation)
    }
}

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{}", self.0)
    }
}

impl fmt::Display for SemaphoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sem{}", self.0)
    }
}

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySpace::Host => write!(f, "host"),
            MemorySpace::Device(ordinal) => write!(f, "{}", ordinal),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Function(h) => write!(f, "{}", h),
            ResourceRef::Event(h) => write!(f, "{}", h),
            ResourceRef::Semaphore(h) => write!(f, "{}", h),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_ids_are_unique() {
        let a = GraphId::fresh();
        let b = GraphId::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn node_id_maps_to_node_index() {
        let id = NodeId {
            graph: GraphId(3),
            slot: 42,
            generation: 1,
        };
        assert_eq!(id.index().index(), 42);
    }

    #[test]
    fn node_id_display() {
        let id = NodeId {
            graph: GraphId(3),
            slot: 7,
            generation: 2,
        };
        assert_eq!(format!("{}", id), "g3/n7v2");
    }

    #[test]
    fn device_ptr_display_is_hex() {
        assert_eq!(format!("{}", DevicePtr(0x1000)), "0x1000");
        assert_eq!(DevicePtr(0x1000).offset(0x20), DevicePtr(0x1020));
        assert_eq!(DevicePtr(u64::MAX - 1).offset(8), DevicePtr(u64::MAX));
        assert_eq!(DevicePtr(u64::MAX - 1).checked_offset(8), None);
    }

    #[test]
    fn memory_space_display() {
        assert_eq!(format!("{}", MemorySpace::Host), "host");
        assert_eq!(format!("{}", MemorySpace::Device(DeviceOrdinal(1))), "dev1");
    }

    #[test]
    fn serde_roundtrip() {
        let id = NodeId {
            graph: GraphId(9),
            slot: 1,
            generation: 4,
        };
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);

        let space = MemorySpace::Device(DeviceOrdinal(2));
        let json = serde_json::to_string(&space).unwrap();
        let back: MemorySpace = serde_json::from_str(&json).unwrap();
        assert_eq!(space, back);
    }
}
