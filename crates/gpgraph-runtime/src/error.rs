//! Runtime errors: control-plane failures and replay-time device faults.

use thiserror::Error;

use gpgraph_core::{DevicePtr, FunctionHandle, NodeId, ResourceRef, StructuralError};
use gpgraph_exec::{
    CaptureError, ExecId, InstantiateError, QueueId, ResourceError, UpdateError,
};

/// A fault raised while a queue executes work. Faults are sticky: once a
/// queue faults it skips all further work and `synchronize` keeps
/// reporting the first fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceFault {
    #[error("memory fault{}: {source}", at(.node))]
    Memory {
        node: Option<NodeId>,
        source: ResourceError,
    },

    /// A replay started while an allocation from an earlier replay was
    /// still live and auto-free-on-launch was off.
    #[error("{exec}: allocation {address} from an earlier launch was never freed")]
    UnfreedAllocation { exec: ExecId, address: DevicePtr },

    /// A replay freed an address that was not live.
    #[error("free of {address} which is not allocated{}", at(.node))]
    InvalidFree {
        node: Option<NodeId>,
        address: DevicePtr,
    },

    #[error("kernel {function} failed{}: {message}", at(.node))]
    KernelFailed {
        node: Option<NodeId>,
        function: FunctionHandle,
        message: String,
    },

    #[error("host callback panicked{}", at(.node))]
    HostCallbackPanicked { node: Option<NodeId> },

    /// The device shut down while the work was running.
    #[error("work aborted by device shutdown")]
    Aborted,

    /// A handle was released after the work referring to it was submitted.
    #[error("{resource} was released{}", at(.node))]
    StaleHandle {
        node: Option<NodeId>,
        resource: ResourceRef,
    },
}

/// Errors from queue and device operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Instantiate(#[from] InstantiateError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// A control-plane call was made from a host callback thread.
    #[error("control-plane call from inside a host callback")]
    HostCallbackReentry,

    #[error("device fault: {0}")]
    Fault(#[from] DeviceFault),

    /// The queue's worker is gone (the device was dropped).
    #[error("queue {queue} is closed")]
    Closed { queue: QueueId },

    #[error("unknown handle: {resource}")]
    UnknownHandle { resource: ResourceRef },

    #[error("failed to start the device runtime: {0}")]
    Startup(#[from] std::io::Error),
}

fn at(node: &Option<NodeId>) -> String {
    match node {
        Some(node) => format!(" at node {}", node),
        None => String::new(),
    }
}
