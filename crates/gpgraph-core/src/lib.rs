//! Core data model for command graphs: handles, node parameter blocks and
//! the [`Graph`] builder.

pub mod address;
pub mod arena;
pub mod dot;
pub mod error;
pub mod graph;
pub mod id;
pub mod node;

// Re-export commonly used types
pub use arena::{Arena, Key};
pub use error::StructuralError;
pub use graph::{Graph, InstanceLease, LeaseGuard};
pub use id::{
    ContextHandle, DeviceOrdinal, DevicePtr, EventHandle, FunctionHandle, GraphId, MemorySpace,
    NodeId, ResourceRef, SemaphoreHandle,
};
pub use node::{
    ChildGraphParams, CopyShape, Dim3, HostCallbackContext, HostFn, HostParams, KernelParams,
    MemAllocParams, MemFreeParams, MemLocation, MemcpyParams, MemsetParams, Node, NodeKind,
    NodeParams, SemaphoreParams, SetShape,
};
