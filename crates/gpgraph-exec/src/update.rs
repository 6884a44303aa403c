//! Update engine: reconciles a live executable with a modified graph.
//!
//! The comparison is strict and positional. Nodes of the two graphs are
//! paired by insertion order; the node count, the kind sequence and every
//! pair's dependency positions must match. Then each pair is checked under
//! its kind's rule:
//!
//! | kind | may change | must not change |
//! |---|---|---|
//! | kernel | grid, block, shared memory, arguments | function |
//! | memcpy | addresses, extents | dimensionality, memory spaces |
//! | memset | address, value, extents | dimensionality, element size, device |
//! | host | callback, label | |
//! | child graph | anything its own update allows | |
//! | event record / wait | event | |
//! | semaphore signal / wait | handles, values | count |
//! | alloc / free | nothing | everything |
//!
//! All checks run before anything is mutated, so a rejected update leaves
//! the executable exactly as it was.

use std::sync::Arc;

use tracing::debug;

use gpgraph_core::{Graph, NodeId, NodeParams};

use crate::compiled::{CompiledOp, CompiledProgram};
use crate::error::{UpdateError, UpdateErrorKind};
use crate::executable::Executable;
use crate::fingerprint::topology_fingerprint;

impl Executable {
    /// Replaces the executable's parameters with those of `graph`, which
    /// must have the same topology as the graph it was instantiated from.
    ///
    /// Replays launched before the update keep the program they were
    /// launched with.
    pub fn update(&mut self, graph: &Graph) -> Result<(), UpdateError> {
        let fingerprint = topology_fingerprint(graph);
        let same_topology = fingerprint == self.fingerprint;
        let (program, patches) =
            reconcile_graph(&self.snapshot, &self.program, graph, same_topology)?;

        let rejected = |node| UpdateError::new(UpdateErrorKind::ParametersChanged, Some(node));
        for (node, params) in &patches {
            self.snapshot
                .check_node_params(*node, params)
                .map_err(|_| rejected(*node))?;
        }
        for (node, params) in patches {
            self.snapshot
                .set_node_params(node, params)
                .map_err(|_| rejected(node))?;
        }
        self.program = Arc::new(program);
        self.fingerprint = fingerprint;
        debug!(
            exec = %self.id(),
            nodes = graph.node_count(),
            fast_path = same_topology,
            "updated executable"
        );
        Ok(())
    }
}

/// Checks `new` against `old` (with its compiled `program`) and returns the
/// patched program plus the parameter patches to apply to `old`, keyed by
/// `old`'s node ids. Nothing is mutated.
pub(crate) fn reconcile_graph(
    old: &Graph,
    program: &CompiledProgram,
    new: &Graph,
    same_topology: bool,
) -> Result<(CompiledProgram, Vec<(NodeId, NodeParams)>), UpdateError> {
    if !same_topology {
        compare_topology(old, new)?;
    }

    let mut ops: Vec<(usize, CompiledOp)> = Vec::with_capacity(new.node_count());
    let mut patches: Vec<(NodeId, NodeParams)> = Vec::new();
    for (position, ((old_id, old_node), (new_id, new_node))) in
        old.nodes().zip(new.nodes()).enumerate()
    {
        let index = program
            .index_at_position(position)
            .ok_or_else(|| UpdateError::topology(Some(new_id)))?;
        let current = &program.nodes()[index].op;
        let op = reconcile_node(&old_node.params, &new_node.params, new_id, current)?;
        ops.push((index, op));
        if !new_node.params.is_memory_node() {
            patches.push((old_id, new_node.params.snapshot()));
        }
    }

    Ok((program.with_ops(ops), patches))
}

/// Node count, kind sequence and dependency positions must all match.
fn compare_topology(old: &Graph, new: &Graph) -> Result<(), UpdateError> {
    if old.node_count() != new.node_count() {
        return Err(UpdateError::topology(None));
    }
    if old
        .nodes()
        .zip(new.nodes())
        .any(|((_, a), (_, b))| a.kind() != b.kind())
    {
        return Err(UpdateError::topology(None));
    }
    for (old_id, new_id) in old.node_ids().into_iter().zip(new.node_ids()) {
        if dependency_positions(old, old_id) != dependency_positions(new, new_id) {
            return Err(UpdateError::topology(Some(new_id)));
        }
    }
    Ok(())
}

fn dependency_positions(graph: &Graph, node: NodeId) -> Vec<usize> {
    let mut positions: Vec<usize> = graph
        .dependencies(node)
        .unwrap_or_default()
        .iter()
        .filter_map(|d| graph.position(*d))
        .collect();
    positions.sort_unstable();
    positions
}

/// Applies the per-kind rule to one node pair and lowers the new
/// parameters. `node` names the node in errors; `current` is the op the
/// executable holds for it now.
pub(crate) fn reconcile_node(
    old: &NodeParams,
    new: &NodeParams,
    node: NodeId,
    current: &CompiledOp,
) -> Result<CompiledOp, UpdateError> {
    let reject = |kind| Err(UpdateError::new(kind, Some(node)));
    match (old, new) {
        (NodeParams::Kernel(a), NodeParams::Kernel(b)) => {
            if a.function != b.function {
                return reject(UpdateErrorKind::FunctionChanged);
            }
        }
        (NodeParams::Memcpy(a), NodeParams::Memcpy(b)) => {
            if a.shape.dimensionality() != b.shape.dimensionality()
                || a.src.space != b.src.space
                || a.dst.space != b.dst.space
            {
                return reject(UpdateErrorKind::ParametersChanged);
            }
        }
        (NodeParams::Memset(a), NodeParams::Memset(b)) => {
            if a.shape.dimensionality() != b.shape.dimensionality()
                || a.element_size != b.element_size
                || a.device != b.device
            {
                return reject(UpdateErrorKind::ParametersChanged);
            }
        }
        (NodeParams::ChildGraph(a), NodeParams::ChildGraph(b)) => {
            let CompiledOp::Child(child) = current else {
                return reject(UpdateErrorKind::TopologyChanged);
            };
            let (program, _) = reconcile_graph(&a.graph, child, &b.graph, false).map_err(|e| {
                UpdateError::new(e.kind, e.node.or(Some(node)))
            })?;
            return Ok(CompiledOp::Child(Arc::new(program)));
        }
        (NodeParams::SemaphoreSignal(a), NodeParams::SemaphoreSignal(b))
        | (NodeParams::SemaphoreWait(a), NodeParams::SemaphoreWait(b)) => {
            if a.semaphores.len() != b.semaphores.len() {
                return reject(UpdateErrorKind::ParametersChanged);
            }
        }
        (NodeParams::MemAlloc(a), NodeParams::MemAlloc(b)) => {
            if a != b {
                return reject(UpdateErrorKind::ParametersChanged);
            }
        }
        (NodeParams::MemFree(a), NodeParams::MemFree(b)) => {
            if a != b {
                return reject(UpdateErrorKind::ParametersChanged);
            }
        }
        (NodeParams::Host(_), NodeParams::Host(_))
        | (NodeParams::EventRecord(_), NodeParams::EventRecord(_))
        | (NodeParams::EventWait(_), NodeParams::EventWait(_))
        | (NodeParams::Empty, NodeParams::Empty) => {}
        _ => return reject(UpdateErrorKind::TopologyChanged),
    }

    if new.validate().is_err() {
        return reject(UpdateErrorKind::ParametersChanged);
    }
    CompiledOp::lower(node, new).map_err(|_| UpdateError::new(UpdateErrorKind::ParametersChanged, Some(node)))
}
