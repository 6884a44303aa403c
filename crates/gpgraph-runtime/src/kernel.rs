//! Loaded kernels and their host emulation.
//!
//! A kernel is identified only by its [`FunctionHandle`]. It may carry an
//! emulation body, run once per launch with access to the launch
//! configuration, the raw argument bytes and simulated memory. Kernels
//! without a body complete without side effects.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use gpgraph_core::{DevicePtr, Dim3, KernelParams, NodeId};

use crate::memory::SimulatedMemory;

pub type KernelFn = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct KernelEntry {
    pub(crate) name: String,
    pub(crate) body: Option<KernelFn>,
}

impl fmt::Debug for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEntry")
            .field("name", &self.name)
            .field("emulated", &self.body.is_some())
            .finish()
    }
}

/// What an emulated kernel sees during one launch.
pub struct KernelContext<'a> {
    node: Option<NodeId>,
    params: &'a KernelParams,
    memory: &'a Mutex<SimulatedMemory>,
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(
        node: Option<NodeId>,
        params: &'a KernelParams,
        memory: &'a Mutex<SimulatedMemory>,
    ) -> Self {
        KernelContext {
            node,
            params,
            memory,
        }
    }

    /// The graph node being replayed; `None` for eager launches.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn grid(&self) -> Dim3 {
        self.params.grid
    }

    pub fn block(&self) -> Dim3 {
        self.params.block
    }

    /// Total number of threads in the launch.
    pub fn threads(&self) -> u64 {
        self.params.grid.volume().saturating_mul(self.params.block.volume())
    }

    pub fn args(&self) -> &[u8] {
        &self.params.args
    }

    /// The `index`-th 8-byte little-endian argument.
    pub fn arg_u64(&self, index: usize) -> Result<u64, String> {
        let start = index * 8;
        self.params
            .args
            .get(start..start + 8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| format!("missing argument {}", index))
    }

    /// The `index`-th argument read as a device pointer.
    pub fn arg_ptr(&self, index: usize) -> Result<DevicePtr, String> {
        self.arg_u64(index).map(DevicePtr)
    }

    pub fn read(&self, address: DevicePtr, len: u64) -> Result<Vec<u8>, String> {
        self.lock().read(address, len).map_err(|e| e.to_string())
    }

    pub fn write(&mut self, address: DevicePtr, bytes: &[u8]) -> Result<(), String> {
        self.lock().write(address, bytes).map_err(|e| e.to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Packs 8-byte little-endian kernel arguments.
pub fn pack_args(args: &[u64]) -> Vec<u8> {
    args.iter().flat_map(|a| a.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use gpgraph_core::{FunctionHandle, Key};

    use super::*;

    fn params(args: Vec<u8>) -> KernelParams {
        let function = FunctionHandle(Key {
            index: 0,
            generation: 0,
        });
        KernelParams::new(function, Dim3::linear(2), Dim3::new(4, 2, 1)).with_args(args)
    }

    #[test]
    fn arguments_decode_little_endian() {
        let memory = Mutex::new(SimulatedMemory::new(1024));
        let params = params(pack_args(&[7, 0x1000_0000]));
        let ctx = KernelContext::new(None, &params, &memory);
        assert_eq!(ctx.arg_u64(0), Ok(7));
        assert_eq!(ctx.arg_ptr(1), Ok(DevicePtr(0x1000_0000)));
        assert!(ctx.arg_u64(2).is_err());
        assert_eq!(ctx.threads(), 16);
    }

    #[test]
    fn memory_access_goes_through_simulated_memory() {
        let memory = Mutex::new(SimulatedMemory::new(1024));
        let buf = memory.lock().unwrap().allocate(4).unwrap();
        let params = params(Vec::new());
        let mut ctx = KernelContext::new(None, &params, &memory);
        ctx.write(buf, &[9, 9]).unwrap();
        assert_eq!(ctx.read(buf, 3).unwrap(), vec![9, 9, 0]);
        assert!(ctx.read(DevicePtr(1), 1).is_err());
    }
}
