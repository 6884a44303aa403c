//! Compiled form of a graph: a flat, topologically ordered op list.
//!
//! Nodes are stored in a deterministic topological order (ties broken by
//! insertion order) and grouped into dependency levels; every node of a
//! level depends only on nodes of earlier levels, so a level can run
//! concurrently. The program is immutable once built: patching produces a
//! new program, so replays that already hold the old one are unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use gpgraph_core::{
    DeviceOrdinal, DevicePtr, EventHandle, Graph, HostParams, KernelParams, MemcpyParams,
    MemsetParams, NodeId, NodeKind, NodeParams, SemaphoreParams,
};

use crate::error::ValidationError;

/// One lowered operation.
#[derive(Debug, Clone)]
pub enum CompiledOp {
    Kernel(KernelParams),
    Memcpy(MemcpyParams),
    Memset(MemsetParams),
    Host(HostParams),
    Child(Arc<CompiledProgram>),
    EventRecord(EventHandle),
    EventWait(EventHandle),
    SemaphoreSignal(SemaphoreParams),
    SemaphoreWait(SemaphoreParams),
    MemAlloc {
        address: DevicePtr,
        size: u64,
        device: DeviceOrdinal,
    },
    MemFree {
        address: DevicePtr,
    },
    Empty,
}

impl CompiledOp {
    pub fn kind(&self) -> NodeKind {
        match self {
            CompiledOp::Kernel(_) => NodeKind::Kernel,
            CompiledOp::Memcpy(_) => NodeKind::Memcpy,
            CompiledOp::Memset(_) => NodeKind::Memset,
            CompiledOp::Host(_) => NodeKind::Host,
            CompiledOp::Child(_) => NodeKind::ChildGraph,
            CompiledOp::EventRecord(_) => NodeKind::EventRecord,
            CompiledOp::EventWait(_) => NodeKind::EventWait,
            CompiledOp::SemaphoreSignal(_) => NodeKind::SemaphoreSignal,
            CompiledOp::SemaphoreWait(_) => NodeKind::SemaphoreWait,
            CompiledOp::MemAlloc { .. } => NodeKind::MemAlloc,
            CompiledOp::MemFree { .. } => NodeKind::MemFree,
            CompiledOp::Empty => NodeKind::Empty,
        }
    }

    /// Lowers one parameter block. Child graphs are compiled recursively.
    pub fn lower(node: NodeId, params: &NodeParams) -> Result<CompiledOp, ValidationError> {
        let op = match params {
            NodeParams::Kernel(k) => CompiledOp::Kernel(k.clone()),
            NodeParams::Memcpy(c) => CompiledOp::Memcpy(*c),
            NodeParams::Memset(s) => CompiledOp::Memset(*s),
            NodeParams::Host(h) => CompiledOp::Host(h.clone()),
            NodeParams::ChildGraph(child) => {
                CompiledOp::Child(Arc::new(CompiledProgram::compile(&child.graph)?))
            }
            NodeParams::EventRecord(e) => CompiledOp::EventRecord(*e),
            NodeParams::EventWait(e) => CompiledOp::EventWait(*e),
            NodeParams::SemaphoreSignal(p) => CompiledOp::SemaphoreSignal(p.clone()),
            NodeParams::SemaphoreWait(p) => CompiledOp::SemaphoreWait(p.clone()),
            NodeParams::MemAlloc(a) => {
                let address = a.address.ok_or_else(|| ValidationError::InvalidParameters {
                    node,
                    reason: "alloc node has no reserved address".to_string(),
                })?;
                CompiledOp::MemAlloc {
                    address,
                    size: a.size,
                    device: a.device,
                }
            }
            NodeParams::MemFree(f) => CompiledOp::MemFree { address: f.address },
            NodeParams::Empty => CompiledOp::Empty,
        };
        Ok(op)
    }
}

#[derive(Debug, Clone)]
pub struct CompiledNode {
    /// The graph node this op was lowered from.
    pub source: NodeId,
    pub op: CompiledOp,
    /// Indices of the nodes this one waits for; always smaller than its own.
    pub deps: SmallVec<[u32; 4]>,
    pub level: u32,
    /// Disabled nodes are skipped at replay but keep their ordering edges.
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompiledProgram {
    nodes: Vec<CompiledNode>,
    levels: Vec<Vec<u32>>,
    /// Insertion position in the source graph -> compiled index.
    positions: Vec<u32>,
    index: HashMap<NodeId, u32>,
}

impl CompiledProgram {
    /// Lowers `graph` into topological order.
    pub fn compile(graph: &Graph) -> Result<CompiledProgram, ValidationError> {
        let order = graph
            .topological_order()
            .map_err(|node| ValidationError::Cycle { node })?;

        let index: HashMap<NodeId, u32> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as u32))
            .collect();

        let mut nodes: Vec<CompiledNode> = Vec::with_capacity(order.len());
        let mut levels: Vec<Vec<u32>> = Vec::new();
        for (i, id) in order.iter().enumerate() {
            let node = graph.node(*id).map_err(|_| ValidationError::Cycle { node: *id })?;
            let deps: SmallVec<[u32; 4]> = graph
                .dependencies(*id)
                .map_err(|_| ValidationError::Cycle { node: *id })?
                .iter()
                .filter_map(|d| index.get(d).copied())
                .collect();
            let level = deps
                .iter()
                .map(|d| nodes[*d as usize].level + 1)
                .max()
                .unwrap_or(0);
            if levels.len() <= level as usize {
                levels.resize_with(level as usize + 1, Vec::new);
            }
            levels[level as usize].push(i as u32);
            nodes.push(CompiledNode {
                source: *id,
                op: CompiledOp::lower(*id, &node.params)?,
                deps,
                level,
                enabled: true,
            });
        }

        let positions = graph
            .node_ids()
            .iter()
            .filter_map(|id| index.get(id).copied())
            .collect();

        Ok(CompiledProgram {
            nodes,
            levels,
            positions,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in execution order.
    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&CompiledNode> {
        self.nodes.get(index)
    }

    /// Compiled indices grouped by dependency level.
    pub fn levels(&self) -> &[Vec<u32>] {
        &self.levels
    }

    /// Compiled index of a source node.
    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.index.get(&node).map(|i| *i as usize)
    }

    /// Compiled index of the node inserted at `position` in the source graph.
    pub fn index_at_position(&self, position: usize) -> Option<usize> {
        self.positions.get(position).map(|i| *i as usize)
    }

    /// Every `(address, size, device)` bound by alloc nodes, child programs
    /// included.
    pub fn allocations(&self) -> Vec<(DevicePtr, u64, DeviceOrdinal)> {
        let mut out = Vec::new();
        self.collect_allocations(&mut out);
        out
    }

    fn collect_allocations(&self, out: &mut Vec<(DevicePtr, u64, DeviceOrdinal)>) {
        for node in &self.nodes {
            match &node.op {
                CompiledOp::MemAlloc {
                    address,
                    size,
                    device,
                } => out.push((*address, *size, *device)),
                CompiledOp::Child(child) => child.collect_allocations(out),
                _ => {}
            }
        }
    }

    /// Number of kernel nodes, child programs included.
    pub fn kernel_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match &n.op {
                CompiledOp::Kernel(_) => 1,
                CompiledOp::Child(child) => child.kernel_count(),
                _ => 0,
            })
            .sum()
    }

    /// Returns a copy with the ops at the given indices replaced.
    pub(crate) fn with_ops(&self, ops: Vec<(usize, CompiledOp)>) -> CompiledProgram {
        let mut next = self.clone();
        for (index, op) in ops {
            next.nodes[index].op = op;
        }
        next
    }

    /// Returns a copy with one node enabled or disabled.
    pub(crate) fn with_enabled(&self, index: usize, enabled: bool) -> CompiledProgram {
        let mut next = self.clone();
        next.nodes[index].enabled = enabled;
        next
    }
}
