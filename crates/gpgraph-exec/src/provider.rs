//! The seam between the engine and the raw device.
//!
//! Instantiation asks the provider whether external handles are still live
//! and binds physical backing to every virtual address an alloc node
//! reserved. The runtime's `Device` implements this trait; tests use
//! in-memory fakes.

use gpgraph_core::{DeviceOrdinal, DevicePtr, ResourceRef};

use crate::error::ResourceError;

pub trait ResourceProvider: Send + Sync {
    /// Returns `true` if the handle refers to a resource that still exists.
    fn is_live(&self, resource: ResourceRef) -> bool;

    /// Backs `size` bytes at `address` on `device`.
    fn bind_allocation(
        &self,
        address: DevicePtr,
        size: u64,
        device: DeviceOrdinal,
    ) -> Result<(), ResourceError>;

    /// Releases backing bound by [`bind_allocation`](Self::bind_allocation).
    fn release_allocation(&self, address: DevicePtr);
}
