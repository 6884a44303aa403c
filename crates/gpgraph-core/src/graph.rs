//! Graph: the dependency DAG of work nodes.
//!
//! [`Graph`] is the single entry point for building command graphs, either
//! directly through the builder methods or indirectly through stream capture.
//! It enforces the structural invariants at mutation time:
//!
//! - edges are unique, self-edges and cycles are rejected;
//! - a dependency must be a live member of the graph;
//! - while the graph holds stream-ordered allocation or free nodes, edges
//!   and nodes can no longer be removed or rewired (nodes can still be
//!   appended, which is what capture does).
//!
//! Any rejected mutation leaves the graph exactly as it was.
//!
//! Nodes live in a petgraph `StableGraph` so indices survive removals. Each
//! slot carries a generation counter; a [`NodeId`] is only valid while its
//! generation matches. Insertion order is tracked separately because the
//! update engine pairs nodes of two graphs by the order they were added.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::{Directed, Direction};
use smallvec::SmallVec;

use crate::address;
use crate::error::StructuralError;
use crate::id::{DevicePtr, GraphId, NodeId};
use crate::node::{
    ChildGraphParams, MemAllocParams, MemFreeParams, MemsetParams, Node, NodeParams,
};

/// A directed acyclic graph of work nodes.
#[derive(Debug)]
pub struct Graph {
    id: GraphId,
    dag: StableGraph<Node, (), Directed, u32>,
    /// Current generation of every slot ever used, indexed by slot.
    generations: Vec<u32>,
    /// Live nodes in insertion order.
    order: IndexSet<NodeId>,
    /// Number of alloc/free nodes at this level (child graphs not included).
    memory_nodes: usize,
    lease: InstanceLease,
    cloned_from: Option<GraphId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Creates an empty graph with a fresh id.
    pub fn new() -> Self {
        Graph {
            id: GraphId::fresh(),
            dag: StableGraph::default(),
            generations: Vec::new(),
            order: IndexSet::new(),
            memory_nodes: 0,
            lease: InstanceLease::default(),
            cloned_from: None,
        }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// The graph this one was cloned from, if any.
    pub fn cloned_from(&self) -> Option<GraphId> {
        self.cloned_from
    }

    /// Returns a read-only reference to the underlying DAG.
    pub fn dag(&self) -> &StableGraph<Node, (), Directed, u32> {
        &self.dag
    }

    /// Single-live-instance token for graphs holding memory nodes.
    pub fn lease(&self) -> &InstanceLease {
        &self.lease
    }

    pub fn node_count(&self) -> usize {
        self.dag.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.dag.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns `true` if this graph (not counting child graphs) holds alloc
    /// or free nodes.
    pub fn contains_memory_nodes(&self) -> bool {
        self.memory_nodes > 0
    }

    /// Like [`contains_memory_nodes`](Self::contains_memory_nodes) but also
    /// looks inside child graphs.
    pub fn contains_memory_nodes_recursive(&self) -> bool {
        self.contains_memory_nodes()
            || self.nodes().any(|(_, node)| match &node.params {
                NodeParams::ChildGraph(child) => child.graph.contains_memory_nodes_recursive(),
                _ => false,
            })
    }

    /// Returns `true` if `id` refers to a live node of this graph.
    pub fn contains(&self, id: NodeId) -> bool {
        self.resolve(id).is_ok()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, StructuralError> {
        let idx = self.resolve(id)?;
        Ok(&self.dag[idx])
    }

    /// Live nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order.iter().map(move |id| (*id, &self.dag[id.index()]))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.order.iter().copied().collect()
    }

    /// Insertion position of a live node.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.get_index_of(&id)
    }

    /// Nodes `id` depends on, in insertion order.
    pub fn dependencies(&self, id: NodeId) -> Result<Vec<NodeId>, StructuralError> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes depending on `id`, in insertion order.
    pub fn dependents(&self, id: NodeId) -> Result<Vec<NodeId>, StructuralError> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Nodes without dependencies, in insertion order.
    pub fn roots(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.dag
                    .neighbors_directed(id.index(), Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// All edges, ordered by the insertion position of their endpoints.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut edges: Vec<(usize, usize, NodeId, NodeId)> = Vec::with_capacity(self.edge_count());
        for (from_pos, from) in self.order.iter().enumerate() {
            for to_idx in self.dag.neighbors_directed(from.index(), Direction::Outgoing) {
                let to = self.id_at(to_idx);
                let to_pos = self.order.get_index_of(&to).unwrap_or(usize::MAX);
                edges.push((from_pos, to_pos, *from, to));
            }
        }
        edges.sort_by_key(|(f, t, _, _)| (*f, *t));
        edges.into_iter().map(|(_, _, f, t)| (f, t)).collect()
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        match (self.resolve(from), self.resolve(to)) {
            (Ok(a), Ok(b)) => self.dag.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Returns `true` if `to` is reachable from `from` (a node reaches itself).
    pub fn has_path(&self, from: NodeId, to: NodeId) -> Result<bool, StructuralError> {
        let a = self.resolve(from)?;
        let b = self.resolve(to)?;
        Ok(petgraph::algo::has_path_connecting(&self.dag, a, b, None))
    }

    /// Maps a node of the graph this one was cloned from to its copy here.
    pub fn find_in_clone(&self, original: NodeId) -> Option<NodeId> {
        if self.cloned_from != Some(original.graph) {
            return None;
        }
        let candidate = NodeId {
            graph: self.id,
            ..original
        };
        self.contains(candidate).then_some(candidate)
    }

    /// Topological order, ties broken by insertion order.
    ///
    /// Returns the first node (in insertion order) left unordered if the
    /// graph is cyclic. Builder methods never allow a cycle, so the error is
    /// only reachable through corrupted state.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, NodeId> {
        let mut in_degree: Vec<usize> = self
            .order
            .iter()
            .map(|id| {
                self.dag
                    .neighbors_directed(id.index(), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(Reverse(pos)) = ready.pop() {
            let id = self.order[pos];
            sorted.push(id);
            for next in self.dag.neighbors_directed(id.index(), Direction::Outgoing) {
                let next_id = self.id_at(next);
                if let Some(next_pos) = self.order.get_index_of(&next_id) {
                    in_degree[next_pos] -= 1;
                    if in_degree[next_pos] == 0 {
                        ready.push(Reverse(next_pos));
                    }
                }
            }
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            let stuck = in_degree
                .iter()
                .position(|d| *d > 0)
                .map(|pos| self.order[pos])
                .unwrap_or(self.order[0]);
            Err(stuck)
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Adds a node depending on every node in `dependencies`.
    ///
    /// Allocation nodes without an address get a freshly reserved virtual
    /// range; read it back through [`node`](Self::node).
    pub fn add_node(
        &mut self,
        mut params: NodeParams,
        dependencies: &[NodeId],
    ) -> Result<NodeId, StructuralError> {
        params.validate()?;

        let mut deps: SmallVec<[NodeIndex<u32>; 4]> = SmallVec::with_capacity(dependencies.len());
        for (i, dep) in dependencies.iter().enumerate() {
            let idx = self
                .resolve(*dep)
                .map_err(|_| StructuralError::InvalidDependency { node: *dep })?;
            if dependencies[..i].contains(dep) {
                return Err(StructuralError::DuplicateDependency { node: *dep });
            }
            deps.push(idx);
        }

        if let NodeParams::MemAlloc(alloc) = &mut params {
            if alloc.address.is_none() {
                alloc.address = Some(address::reserve(alloc.size));
            }
        }

        let is_memory = params.is_memory_node();
        let idx = self.dag.add_node(Node::new(params));
        let slot = idx.index();
        if slot == self.generations.len() {
            self.generations.push(0);
        }
        let id = self.id_at(idx);

        for dep in deps {
            self.dag.add_edge(dep, idx, ());
        }
        self.order.insert(id);
        if is_memory {
            self.memory_nodes += 1;
        }
        Ok(id)
    }

    /// Adds the dependency edge `from -> to`.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), StructuralError> {
        self.ensure_rewirable("add_edge")?;
        let a = self.resolve(from)?;
        let b = self.resolve(to)?;
        if a == b {
            return Err(StructuralError::CycleDetected { from, to });
        }
        if self.dag.find_edge(a, b).is_some() {
            return Err(StructuralError::DuplicateEdge { from, to });
        }
        if petgraph::algo::has_path_connecting(&self.dag, b, a, None) {
            return Err(StructuralError::CycleDetected { from, to });
        }
        self.dag.add_edge(a, b, ());
        Ok(())
    }

    /// Removes the dependency edge `from -> to`.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) -> Result<(), StructuralError> {
        self.ensure_rewirable("remove_edge")?;
        let a = self.resolve(from)?;
        let b = self.resolve(to)?;
        let edge = self
            .dag
            .find_edge(a, b)
            .ok_or(StructuralError::EdgeNotFound { from, to })?;
        self.dag.remove_edge(edge);
        Ok(())
    }

    /// Removes a node and every edge touching it. Outstanding handles to the
    /// node become stale.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, StructuralError> {
        self.ensure_rewirable("remove_node")?;
        let idx = self.resolve(id)?;
        let node = self
            .dag
            .remove_node(idx)
            .ok_or(StructuralError::NodeNotFound { node: id })?;
        let generation = &mut self.generations[idx.index()];
        *generation = generation.wrapping_add(1);
        self.order.shift_remove(&id);
        if node.params.is_memory_node() {
            self.memory_nodes -= 1;
        }
        Ok(node)
    }

    /// Replaces a node's parameters, returning the old ones. The kind must
    /// stay the same; memory nodes are immutable.
    pub fn set_node_params(
        &mut self,
        id: NodeId,
        params: NodeParams,
    ) -> Result<NodeParams, StructuralError> {
        self.check_node_params(id, &params)?;
        let idx = self.resolve(id)?;
        Ok(std::mem::replace(&mut self.dag[idx].params, params))
    }

    /// Checks that [`set_node_params`](Self::set_node_params) would accept
    /// `params` for `id`, without changing anything.
    pub fn check_node_params(
        &self,
        id: NodeId,
        params: &NodeParams,
    ) -> Result<(), StructuralError> {
        let idx = self.resolve(id)?;
        let current = self.dag[idx].kind();
        if current != params.kind() {
            return Err(StructuralError::KindMismatch {
                node: id,
                expected: current,
                actual: params.kind(),
            });
        }
        if params.is_memory_node() {
            return Err(StructuralError::Unsupported {
                reason: format!("parameters of {} node {} are fixed", current, id),
            });
        }
        params.validate()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn id_at(&self, idx: NodeIndex<u32>) -> NodeId {
        NodeId {
            graph: self.id,
            slot: idx.index() as u32,
            generation: self.generations[idx.index()],
        }
    }

    fn resolve(&self, id: NodeId) -> Result<NodeIndex<u32>, StructuralError> {
        if id.graph != self.id {
            return Err(StructuralError::ForeignNode { node: id });
        }
        let idx = id.index();
        match self.generations.get(idx.index()) {
            Some(generation) if *generation != id.generation => {
                Err(StructuralError::StaleNode { node: id })
            }
            Some(_) if self.dag.contains_node(idx) => Ok(idx),
            _ => Err(StructuralError::NodeNotFound { node: id }),
        }
    }

    fn neighbors(&self, id: NodeId, dir: Direction) -> Result<Vec<NodeId>, StructuralError> {
        let idx = self.resolve(id)?;
        let mut out: Vec<NodeId> = self
            .dag
            .neighbors_directed(idx, dir)
            .map(|n| self.id_at(n))
            .collect();
        out.sort_by_key(|n| self.order.get_index_of(n));
        Ok(out)
    }

    fn ensure_rewirable(&self, op: &str) -> Result<(), StructuralError> {
        if self.contains_memory_nodes() {
            return Err(StructuralError::Unsupported {
                reason: format!("{} on a graph containing memory alloc/free nodes", op),
            });
        }
        Ok(())
    }
}

/// Deep clone: child graphs are cloned recursively, the copy gets a fresh
/// id and its own instantiation lease. Slots and generations are kept so
/// [`Graph::find_in_clone`] can map nodes across.
///
/// Every allocation node of the copy gets a freshly reserved virtual range,
/// and pointers into the original ranges (free targets, copy and set
/// addresses, kernel argument words) are rewritten to match, so the copy
/// can be instantiated while the original is. Use
/// [`Graph::snapshot`] for a copy that keeps the addresses.
impl Clone for Graph {
    fn clone(&self) -> Self {
        self.copy(Some(&[]))
    }
}

impl Graph {
    /// Deep copy that keeps every allocation address. Executables keep one
    /// of their source graph; it cannot be instantiated while the original
    /// is live.
    pub fn snapshot(&self) -> Graph {
        self.copy(None)
    }

    /// `relocate` carries the ranges already moved by enclosing graphs, or
    /// `None` to keep addresses.
    fn copy(&self, relocate: Option<&[Relocation]>) -> Graph {
        let relocations = relocate.map(|inherited| {
            let mut all = inherited.to_vec();
            all.extend(self.nodes().filter_map(|(_, node)| match node.params {
                NodeParams::MemAlloc(MemAllocParams {
                    size,
                    address: Some(from),
                    ..
                }) => Some(Relocation {
                    from: from.0,
                    len: address::aligned_size(size),
                    to: address::reserve(size).0,
                }),
                _ => None,
            }));
            all
        });

        let id = GraphId::fresh();
        Graph {
            id,
            dag: self.dag.map(
                |_, node| Node::new(copy_params(&node.params, relocations.as_deref())),
                |_, _| (),
            ),
            generations: self.generations.clone(),
            order: self
                .order
                .iter()
                .map(|n| NodeId { graph: id, ..*n })
                .collect(),
            memory_nodes: self.memory_nodes,
            lease: InstanceLease::default(),
            cloned_from: Some(self.id),
        }
    }
}

impl NodeParams {
    /// Copy of the parameters that keeps allocation addresses, including
    /// those inside child graphs.
    pub fn snapshot(&self) -> NodeParams {
        copy_params(self, None)
    }
}

/// An allocation moved to a fresh virtual range by a clone.
#[derive(Debug, Clone, Copy)]
struct Relocation {
    from: u64,
    len: u64,
    to: u64,
}

fn relocated(relocations: &[Relocation], ptr: DevicePtr) -> DevicePtr {
    relocations
        .iter()
        .find(|r| ptr.0 >= r.from && ptr.0 - r.from < r.len)
        .map_or(ptr, |r| DevicePtr(r.to + (ptr.0 - r.from)))
}

fn copy_params(params: &NodeParams, relocations: Option<&[Relocation]>) -> NodeParams {
    let Some(relocations) = relocations else {
        return match params {
            NodeParams::ChildGraph(child) => NodeParams::ChildGraph(ChildGraphParams {
                graph: Box::new(child.graph.copy(None)),
            }),
            other => other.clone(),
        };
    };

    let moved = |ptr| relocated(relocations, ptr);
    match params {
        NodeParams::ChildGraph(child) => NodeParams::ChildGraph(ChildGraphParams {
            graph: Box::new(child.graph.copy(Some(relocations))),
        }),
        NodeParams::MemAlloc(alloc) => NodeParams::MemAlloc(MemAllocParams {
            address: alloc.address.map(moved),
            ..*alloc
        }),
        NodeParams::MemFree(free) => NodeParams::MemFree(MemFreeParams {
            address: moved(free.address),
        }),
        NodeParams::Memset(set) => NodeParams::Memset(MemsetParams {
            dst: moved(set.dst),
            ..*set
        }),
        NodeParams::Memcpy(copy) => {
            let mut copy = *copy;
            copy.src.ptr = moved(copy.src.ptr);
            copy.dst.ptr = moved(copy.dst.ptr);
            NodeParams::Memcpy(copy)
        }
        NodeParams::Kernel(kernel) => {
            let mut kernel = kernel.clone();
            relocate_args(&mut kernel.args, relocations);
            NodeParams::Kernel(kernel)
        }
        other => other.clone(),
    }
}

/// Kernel arguments are opaque; a pointer is recognized as an 8-byte
/// aligned little-endian word inside a relocated range.
fn relocate_args(args: &mut [u8], relocations: &[Relocation]) {
    for word in args.chunks_exact_mut(8) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(word);
        let ptr = DevicePtr(u64::from_le_bytes(raw));
        let moved = relocated(relocations, ptr);
        if moved != ptr {
            word.copy_from_slice(&moved.0.to_le_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Instantiation lease
// ---------------------------------------------------------------------------

/// Token guaranteeing at most one live executable for a graph whose
/// allocation addresses are bound at instantiation.
#[derive(Debug, Default)]
pub struct InstanceLease(Arc<AtomicBool>);

impl InstanceLease {
    /// Takes the lease, or returns `None` if an executable already holds it.
    pub fn try_acquire(&self) -> Option<LeaseGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LeaseGuard(Arc::clone(&self.0)))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Held by an executable; releases the lease on drop.
#[derive(Debug)]
pub struct LeaseGuard(Arc<AtomicBool>);

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Key;
    use crate::id::{DeviceOrdinal, DevicePtr, FunctionHandle};
    use crate::node::{
        ChildGraphParams, Dim3, KernelParams, MemAllocParams, MemFreeParams, NodeKind,
    };

    fn kernel(n: u32) -> NodeParams {
        NodeParams::Kernel(KernelParams::new(
            FunctionHandle(Key {
                index: 0,
                generation: 0,
            }),
            Dim3::linear(n),
            Dim3::linear(64),
        ))
    }

    fn chain(len: usize) -> (Graph, Vec<NodeId>) {
        let mut graph = Graph::new();
        let mut ids: Vec<NodeId> = Vec::new();
        for i in 0..len {
            let deps: Vec<NodeId> = ids.last().copied().into_iter().collect();
            ids.push(graph.add_node(kernel(i as u32 + 1), &deps).unwrap());
        }
        (graph, ids)
    }

    #[test]
    fn add_node_records_dependencies() {
        let (graph, ids) = chain(3);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.roots(), vec![ids[0]]);
        assert_eq!(graph.dependencies(ids[2]).unwrap(), vec![ids[1]]);
        assert_eq!(graph.dependents(ids[0]).unwrap(), vec![ids[1]]);
        assert_eq!(graph.edges(), vec![(ids[0], ids[1]), (ids[1], ids[2])]);
    }

    #[test]
    fn add_node_rejects_unknown_dependency() {
        let mut other = Graph::new();
        let foreign = other.add_node(NodeParams::Empty, &[]).unwrap();

        let mut graph = Graph::new();
        let err = graph.add_node(NodeParams::Empty, &[foreign]).unwrap_err();
        assert_eq!(err, StructuralError::InvalidDependency { node: foreign });
        assert!(graph.is_empty());
    }

    #[test]
    fn add_node_rejects_repeated_dependency() {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeParams::Empty, &[]).unwrap();
        let err = graph.add_node(NodeParams::Empty, &[a, a]).unwrap_err();
        assert_eq!(err, StructuralError::DuplicateDependency { node: a });
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn add_edge_rejects_self_edge_duplicate_and_cycle() {
        let (mut graph, ids) = chain(3);
        assert!(matches!(
            graph.add_edge(ids[1], ids[1]),
            Err(StructuralError::CycleDetected { .. })
        ));
        assert!(matches!(
            graph.add_edge(ids[0], ids[1]),
            Err(StructuralError::DuplicateEdge { .. })
        ));
        assert!(matches!(
            graph.add_edge(ids[2], ids[0]),
            Err(StructuralError::CycleDetected { .. })
        ));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn remove_node_invalidates_handle_and_edges() {
        let (mut graph, ids) = chain(3);
        graph.remove_node(ids[1]).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 0);
        assert!(!graph.contains(ids[1]));

        // Slot reuse bumps the generation.
        let fresh = graph.add_node(NodeParams::Empty, &[]).unwrap();
        assert_eq!(fresh.slot, ids[1].slot);
        assert_ne!(fresh.generation, ids[1].generation);
        assert_eq!(
            graph.node(ids[1]).unwrap_err(),
            StructuralError::StaleNode { node: ids[1] }
        );
        // Insertion order: the re-added node is last.
        assert_eq!(graph.node_ids(), vec![ids[0], ids[2], fresh]);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let (graph, _) = chain(1);
        let (other, other_ids) = chain(1);
        assert_ne!(graph.id(), other.id());
        assert_eq!(
            graph.node(other_ids[0]).unwrap_err(),
            StructuralError::ForeignNode { node: other_ids[0] }
        );
    }

    #[test]
    fn add_node_rejects_overflowing_extents() {
        use crate::node::SetShape;

        let mut graph = Graph::new();
        let set = MemsetParams {
            dst: DevicePtr(0x100),
            device: DeviceOrdinal(0),
            value: 0,
            element_size: 4,
            shape: SetShape::Pitched {
                width: u64::MAX / 2,
                height: 1,
                pitch_bytes: 8,
            },
        };
        let err = graph.add_node(NodeParams::Memset(set), &[]).unwrap_err();
        assert!(matches!(err, StructuralError::InvalidParameters { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn memory_nodes_freeze_structure() {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeParams::Empty, &[]).unwrap();
        let b = graph.add_node(NodeParams::Empty, &[]).unwrap();
        let alloc = graph
            .add_node(
                NodeParams::MemAlloc(MemAllocParams::new(1024, DeviceOrdinal(0))),
                &[a],
            )
            .unwrap();

        assert!(matches!(
            graph.add_edge(a, b),
            Err(StructuralError::Unsupported { .. })
        ));
        assert!(matches!(
            graph.remove_node(b),
            Err(StructuralError::Unsupported { .. })
        ));

        // Appending still works.
        let address = match &graph.node(alloc).unwrap().params {
            NodeParams::MemAlloc(p) => p.address.unwrap(),
            other => panic!("expected alloc params, got {:?}", other),
        };
        graph
            .add_node(NodeParams::MemFree(MemFreeParams { address }), &[alloc])
            .unwrap();
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn set_node_params_enforces_kind() {
        let (mut graph, ids) = chain(1);
        let err = graph.set_node_params(ids[0], NodeParams::Empty).unwrap_err();
        assert_eq!(
            err,
            StructuralError::KindMismatch {
                node: ids[0],
                expected: NodeKind::Kernel,
                actual: NodeKind::Empty,
            }
        );
        let old = graph.set_node_params(ids[0], kernel(99)).unwrap();
        assert_eq!(old.kind(), NodeKind::Kernel);
        match &graph.node(ids[0]).unwrap().params {
            NodeParams::Kernel(k) => assert_eq!(k.grid, Dim3::linear(99)),
            other => panic!("expected kernel, got {:?}", other),
        }
    }

    #[test]
    fn clone_is_independent_and_mappable() {
        let (mut graph, ids) = chain(3);
        let copy = graph.clone();
        assert_ne!(copy.id(), graph.id());
        assert_eq!(copy.cloned_from(), Some(graph.id()));
        assert_eq!(copy.node_count(), 3);
        assert_eq!(copy.edge_count(), 2);

        let mapped = copy.find_in_clone(ids[1]).unwrap();
        assert_eq!(mapped.slot, ids[1].slot);
        assert_eq!(copy.dependencies(mapped).unwrap(), vec![copy.find_in_clone(ids[0]).unwrap()]);

        graph.remove_node(ids[2]).unwrap();
        assert_eq!(copy.node_count(), 3);
    }

    fn alloc_address(graph: &Graph, node: NodeId) -> DevicePtr {
        match graph.node(node).unwrap().params {
            NodeParams::MemAlloc(a) => a.address.unwrap(),
            ref other => panic!("expected alloc params, got {:?}", other),
        }
    }

    #[test]
    fn clone_relocates_allocations() {
        let mut graph = Graph::new();
        let alloc = graph
            .add_node(
                NodeParams::MemAlloc(MemAllocParams::new(512, DeviceOrdinal(0))),
                &[],
            )
            .unwrap();
        let base = alloc_address(&graph, alloc);
        let set = graph
            .add_node(
                NodeParams::Memset(MemsetParams::bytes(base.offset(16), DeviceOrdinal(0), 7, 32)),
                &[alloc],
            )
            .unwrap();
        let args: Vec<u8> = [base.offset(256).0, 42]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let launch = graph
            .add_node(
                NodeParams::Kernel(
                    KernelParams::new(
                        FunctionHandle(Key {
                            index: 0,
                            generation: 0,
                        }),
                        Dim3::linear(1),
                        Dim3::linear(1),
                    )
                    .with_args(args),
                ),
                &[set],
            )
            .unwrap();
        let free = graph
            .add_node(NodeParams::MemFree(MemFreeParams { address: base }), &[launch])
            .unwrap();

        let copy = graph.clone();
        let moved = alloc_address(&copy, copy.find_in_clone(alloc).unwrap());
        assert_ne!(moved, base);
        match &copy.node(copy.find_in_clone(set).unwrap()).unwrap().params {
            NodeParams::Memset(s) => assert_eq!(s.dst, moved.offset(16)),
            other => panic!("expected memset, got {:?}", other),
        }
        match &copy.node(copy.find_in_clone(launch).unwrap()).unwrap().params {
            NodeParams::Kernel(k) => {
                assert_eq!(k.args[..8], moved.offset(256).0.to_le_bytes());
                assert_eq!(k.args[8..], 42u64.to_le_bytes());
            }
            other => panic!("expected kernel, got {:?}", other),
        }
        match &copy.node(copy.find_in_clone(free).unwrap()).unwrap().params {
            NodeParams::MemFree(f) => assert_eq!(f.address, moved),
            other => panic!("expected free, got {:?}", other),
        }

        let kept = graph.snapshot();
        assert_eq!(alloc_address(&kept, kept.find_in_clone(alloc).unwrap()), base);
    }

    #[test]
    fn clone_relocates_parent_pointers_inside_child_graphs() {
        let mut parent = Graph::new();
        let alloc = parent
            .add_node(
                NodeParams::MemAlloc(MemAllocParams::new(64, DeviceOrdinal(0))),
                &[],
            )
            .unwrap();
        let base = alloc_address(&parent, alloc);
        let mut child = Graph::new();
        child
            .add_node(
                NodeParams::Memset(MemsetParams::bytes(base, DeviceOrdinal(0), 1, 64)),
                &[],
            )
            .unwrap();
        let node = parent
            .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&child)), &[alloc])
            .unwrap();

        let copy = parent.clone();
        let moved = alloc_address(&copy, copy.find_in_clone(alloc).unwrap());
        match &copy.node(copy.find_in_clone(node).unwrap()).unwrap().params {
            NodeParams::ChildGraph(c) => match &c.graph.nodes().next().unwrap().1.params {
                NodeParams::Memset(s) => assert_eq!(s.dst, moved),
                other => panic!("expected memset, got {:?}", other),
            },
            other => panic!("expected child graph, got {:?}", other),
        }
    }

    #[test]
    fn clone_recurses_into_child_graphs() {
        let (child, _) = chain(2);
        let mut parent = Graph::new();
        let node = parent
            .add_node(NodeParams::ChildGraph(ChildGraphParams::new(&child)), &[])
            .unwrap();
        let copy = parent.clone();

        let original_child = match &parent.node(node).unwrap().params {
            NodeParams::ChildGraph(c) => c.graph.id(),
            _ => unreachable!(),
        };
        let copied_child = match &copy.node(copy.find_in_clone(node).unwrap()).unwrap().params {
            NodeParams::ChildGraph(c) => c.graph.id(),
            _ => unreachable!(),
        };
        assert_ne!(original_child, copied_child);
        assert_ne!(original_child, child.id());
    }

    #[test]
    fn topological_order_breaks_ties_by_insertion() {
        let mut graph = Graph::new();
        let a = graph.add_node(NodeParams::Empty, &[]).unwrap();
        let b = graph.add_node(NodeParams::Empty, &[]).unwrap();
        let c = graph.add_node(NodeParams::Empty, &[b]).unwrap();
        let d = graph.add_node(NodeParams::Empty, &[]).unwrap();
        graph.add_edge(c, a).unwrap();
        assert_eq!(graph.topological_order().unwrap(), vec![b, c, a, d]);
    }

    #[test]
    fn lease_is_exclusive_until_dropped() {
        let graph = Graph::new();
        let guard = graph.lease().try_acquire().unwrap();
        assert!(graph.lease().try_acquire().is_none());
        assert!(graph.lease().is_held());
        drop(guard);
        assert!(graph.lease().try_acquire().is_some());
    }

    #[test]
    fn alloc_addresses_are_reserved() {
        let mut graph = Graph::new();
        let a = graph
            .add_node(
                NodeParams::MemAlloc(MemAllocParams::new(64, DeviceOrdinal(0))),
                &[],
            )
            .unwrap();
        let b = graph
            .add_node(
                NodeParams::MemAlloc(MemAllocParams {
                    size: 64,
                    device: DeviceOrdinal(0),
                    address: Some(DevicePtr(0x5000)),
                }),
                &[],
            )
            .unwrap();
        let addr = |id| match &graph.node(id).unwrap().params {
            NodeParams::MemAlloc(p) => p.address,
            _ => None,
        };
        assert!(addr(a).is_some_and(crate::address::is_virtual));
        assert_eq!(addr(b), Some(DevicePtr(0x5000)));
    }
}
