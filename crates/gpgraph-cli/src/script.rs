//! JSON graph scripts.
//!
//! A script names device buffers and lists nodes in insertion order. Nodes
//! refer to buffers, allocations and earlier nodes by name:
//!
//! ```json
//! {
//!   "buffers": [{ "name": "a", "size": 64, "fill": 0 }],
//!   "nodes": [
//!     { "name": "set", "op": { "kind": "memset", "dst": "a", "value": 7 } },
//!     { "name": "inc", "after": ["set"],
//!       "op": { "kind": "kernel", "function": "increment", "buffer": "a" } }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use gpgraph_core::{
    DevicePtr, Dim3, FunctionHandle, Graph, HostParams, KernelParams, MemAllocParams,
    MemFreeParams, MemLocation, MemcpyParams, MemsetParams, NodeId, NodeParams,
    StructuralError,
};
use gpgraph_runtime::{pack_args, Device, KernelContext, KernelFn, QueueError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub buffers: Vec<BufferSpec>,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub name: String,
    pub size: u64,
    /// Byte every element starts as.
    #[serde(default)]
    pub fill: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub after: Vec<String>,
    pub op: OpSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpSpec {
    /// Launches a builtin kernel over a buffer.
    Kernel {
        function: String,
        buffer: String,
        #[serde(default = "one")]
        grid: u32,
        #[serde(default = "one")]
        block: u32,
    },
    Memset {
        dst: String,
        value: u8,
        #[serde(default)]
        offset: u64,
        /// Bytes to set; the rest of the region by default.
        count: Option<u64>,
    },
    Memcpy {
        src: String,
        dst: String,
        /// Bytes to copy; the smaller of the two regions by default.
        bytes: Option<u64>,
    },
    /// Prints a line when it runs.
    Host { message: String },
    Alloc { size: u64 },
    /// Frees the allocation made by the named alloc node.
    Free { alloc: String },
    Empty,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed script: {0}")]
    Json(#[from] serde_json::Error),

    #[error("'{name}' is not defined before it is used")]
    UnknownName { name: String },

    #[error("'{name}' is defined twice")]
    DuplicateName { name: String },

    #[error("unknown builtin kernel '{name}' (expected increment, double or noop)")]
    UnknownKernel { name: String },

    #[error("node '{name}': {source}")]
    Graph {
        name: String,
        source: StructuralError,
    },

    #[error(transparent)]
    Device(#[from] QueueError),
}

/// Names of the builtin kernels.
pub const BUILTIN_KERNELS: [&str; 3] = ["increment", "double", "noop"];

/// A script materialized on a device.
#[derive(Debug)]
pub struct Loaded {
    pub graph: Graph,
    pub buffers: Vec<(String, DevicePtr, u64)>,
    pub nodes: HashMap<String, NodeId>,
}

impl Script {
    pub fn parse(text: &str) -> Result<Script, ScriptError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn read(path: &std::path::Path) -> Result<Script, ScriptError> {
        Script::parse(&std::fs::read_to_string(path)?)
    }

    /// Allocates and fills the buffers, loads the kernels and builds the
    /// graph.
    pub fn load(&self, device: &Device) -> Result<Loaded, ScriptError> {
        let kernels = load_builtins(device)?;

        let mut regions: HashMap<String, (DevicePtr, u64)> = HashMap::new();
        let mut buffers = Vec::with_capacity(self.buffers.len());
        for buffer in &self.buffers {
            if regions.contains_key(&buffer.name) {
                return Err(ScriptError::DuplicateName {
                    name: buffer.name.clone(),
                });
            }
            let ptr = device.allocate(buffer.size)?;
            device.write(ptr, &vec![buffer.fill; buffer.size as usize])?;
            regions.insert(buffer.name.clone(), (ptr, buffer.size));
            buffers.push((buffer.name.clone(), ptr, buffer.size));
        }

        let mut graph = Graph::new();
        let mut nodes: HashMap<String, NodeId> = HashMap::new();
        for entry in &self.nodes {
            if nodes.contains_key(&entry.name) {
                return Err(ScriptError::DuplicateName {
                    name: entry.name.clone(),
                });
            }
            let deps = entry
                .after
                .iter()
                .map(|name| nodes.get(name).copied().ok_or_else(|| unknown(name)))
                .collect::<Result<Vec<_>, _>>()?;
            let params = entry.op.params(device, &kernels, &regions)?;
            let id = graph
                .add_node(params, &deps)
                .map_err(|source| ScriptError::Graph {
                    name: entry.name.clone(),
                    source,
                })?;

            if let OpSpec::Alloc { size } = entry.op {
                if let Ok(node) = graph.node(id) {
                    if let NodeParams::MemAlloc(MemAllocParams {
                        address: Some(address),
                        ..
                    }) = node.params
                    {
                        regions.insert(entry.name.clone(), (address, size));
                    }
                }
            }
            nodes.insert(entry.name.clone(), id);
        }

        info!(
            buffers = buffers.len(),
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "script loaded"
        );
        Ok(Loaded {
            graph,
            buffers,
            nodes,
        })
    }
}

impl OpSpec {
    fn params(
        &self,
        device: &Device,
        kernels: &HashMap<&'static str, FunctionHandle>,
        regions: &HashMap<String, (DevicePtr, u64)>,
    ) -> Result<NodeParams, ScriptError> {
        let region = |name: &String| regions.get(name).copied().ok_or_else(|| unknown(name));
        let ordinal = device.ordinal();

        let params = match self {
            OpSpec::Kernel {
                function,
                buffer,
                grid,
                block,
            } => {
                let handle = kernels
                    .get(function.as_str())
                    .copied()
                    .ok_or_else(|| ScriptError::UnknownKernel {
                        name: function.clone(),
                    })?;
                let (ptr, len) = region(buffer)?;
                NodeParams::Kernel(
                    KernelParams::new(handle, Dim3::linear(*grid), Dim3::linear(*block))
                        .with_args(pack_args(&[ptr.0, len])),
                )
            }
            OpSpec::Memset {
                dst,
                value,
                offset,
                count,
            } => {
                let (ptr, len) = region(dst)?;
                let count = count.unwrap_or(len.saturating_sub(*offset));
                NodeParams::Memset(MemsetParams::bytes(ptr.offset(*offset), ordinal, *value, count))
            }
            OpSpec::Memcpy { src, dst, bytes } => {
                let (from, from_len) = region(src)?;
                let (to, to_len) = region(dst)?;
                NodeParams::Memcpy(MemcpyParams::linear(
                    MemLocation::device(from, ordinal),
                    MemLocation::device(to, ordinal),
                    bytes.unwrap_or(from_len.min(to_len)),
                ))
            }
            OpSpec::Host { message } => {
                let message = message.clone();
                NodeParams::Host(
                    HostParams::new(move |ctx| println!("[launch {}] {}", ctx.launch, message))
                        .with_label("print"),
                )
            }
            OpSpec::Alloc { size } => NodeParams::MemAlloc(MemAllocParams::new(*size, ordinal)),
            OpSpec::Free { alloc } => {
                let (address, _) = region(alloc)?;
                NodeParams::MemFree(MemFreeParams { address })
            }
            OpSpec::Empty => NodeParams::Empty,
        };
        Ok(params)
    }
}

fn unknown(name: &str) -> ScriptError {
    ScriptError::UnknownName {
        name: name.to_string(),
    }
}

fn load_builtins(device: &Device) -> Result<HashMap<&'static str, FunctionHandle>, ScriptError> {
    let mut kernels = HashMap::new();
    for name in BUILTIN_KERNELS {
        let body = match name {
            "increment" => Some(byte_kernel(|b| b.wrapping_add(1))),
            "double" => Some(byte_kernel(|b| b.wrapping_mul(2))),
            _ => None,
        };
        kernels.insert(name, device.load_kernel(name, body)?);
    }
    Ok(kernels)
}

/// A kernel applying `f` to every byte of `[arg0, arg0 + arg1)`.
fn byte_kernel(f: fn(u8) -> u8) -> KernelFn {
    Arc::new(move |ctx: &mut KernelContext<'_>| {
        let ptr = ctx.arg_ptr(0)?;
        let len = ctx.arg_u64(1)?;
        let data: Vec<u8> = ctx.read(ptr, len)?.into_iter().map(f).collect();
        ctx.write(ptr, &data)
    })
}

#[cfg(test)]
mod tests {
    use gpgraph_runtime::DeviceConfig;

    use super::*;

    fn device() -> Device {
        Device::new(DeviceConfig {
            memory_capacity: 1 << 20,
            ..DeviceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn parses_tagged_ops_with_defaults() {
        let script = Script::parse(
            r#"{
                "buffers": [{ "name": "a", "size": 8 }],
                "nodes": [
                    { "name": "k", "op": { "kind": "kernel", "function": "noop", "buffer": "a" } },
                    { "name": "j", "after": ["k"], "op": { "kind": "empty" } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(script.buffers[0].fill, 0);
        assert_eq!(
            script.nodes[0].op,
            OpSpec::Kernel {
                function: "noop".to_string(),
                buffer: "a".to_string(),
                grid: 1,
                block: 1,
            }
        );
        assert_eq!(script.nodes[1].after, vec!["k".to_string()]);
    }

    #[test]
    fn rejects_unknown_op_kind() {
        let err = Script::parse(r#"{ "nodes": [{ "name": "x", "op": { "kind": "teleport" } }] }"#)
            .unwrap_err();
        assert!(matches!(err, ScriptError::Json(_)));
    }

    #[test]
    fn load_builds_graph_in_order() {
        let script = Script::parse(
            r#"{
                "buffers": [{ "name": "a", "size": 16, "fill": 1 }, { "name": "b", "size": 16 }],
                "nodes": [
                    { "name": "tmp", "op": { "kind": "alloc", "size": 16 } },
                    { "name": "stage", "after": ["tmp"], "op": { "kind": "memcpy", "src": "a", "dst": "tmp" } },
                    { "name": "out", "after": ["stage"], "op": { "kind": "memcpy", "src": "tmp", "dst": "b" } },
                    { "name": "rel", "after": ["out"], "op": { "kind": "free", "alloc": "tmp" } }
                ]
            }"#,
        )
        .unwrap();
        let device = device();
        let loaded = script.load(&device).unwrap();
        assert_eq!(loaded.graph.node_count(), 4);
        assert_eq!(loaded.graph.edge_count(), 3);
        assert!(loaded.graph.contains_memory_nodes());
        assert_eq!(device.read(loaded.buffers[0].1, 16).unwrap(), vec![1; 16]);
    }

    #[test]
    fn forward_references_are_rejected() {
        let script = Script::parse(
            r#"{ "nodes": [
                { "name": "a", "after": ["b"], "op": { "kind": "empty" } },
                { "name": "b", "op": { "kind": "empty" } }
            ] }"#,
        )
        .unwrap();
        let err = script.load(&device()).unwrap_err();
        assert!(matches!(err, ScriptError::UnknownName { name } if name == "b"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let script = Script::parse(
            r#"{ "nodes": [
                { "name": "a", "op": { "kind": "empty" } },
                { "name": "a", "op": { "kind": "empty" } }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(
            script.load(&device()),
            Err(ScriptError::DuplicateName { .. })
        ));
    }
}
