//! Simulated device runtime for command graphs.
//!
//! - [`Device`]: context, host-backed memory, kernel table, events and
//!   semaphores, and the tokio runtime its queues run on. It is the
//!   [`ResourceProvider`](gpgraph_exec::ResourceProvider) executables are
//!   instantiated against.
//! - [`Queue`]: eager submission, capture, and launch of executables.
//!
//! Control-plane calls (everything on `Device` and `Queue`) are synchronous;
//! only `synchronize` blocks.

mod callback;
pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod queue;
mod replay;
pub mod sync;

pub use config::DeviceConfig;
pub use device::{Device, DeviceStats};
pub use error::{DeviceFault, QueueError};
pub use kernel::{pack_args, KernelContext, KernelFn};
pub use memory::SimulatedMemory;
pub use queue::Queue;
