//! Executable: the instantiated, replayable form of a graph.
//!
//! An [`Executable`] pairs a snapshot of its source graph with the current
//! [`CompiledProgram`]. Patching never edits a program in place: it builds a
//! new one and swaps the `Arc`, so replays already holding the previous
//! program finish with the parameters they were launched with.
//!
//! Resources that must outlive in-flight replays (allocation bindings, the
//! instantiation lease, the replay gate) live in [`ExecShared`]. Dropping
//! the executable only drops one reference; the bindings are released when
//! the last replay lets go of its clone.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use gpgraph_core::{DevicePtr, Graph, LeaseGuard, NodeId, NodeKind, NodeParams};

use crate::compiled::CompiledProgram;
use crate::error::{UpdateError, UpdateErrorKind};
use crate::fingerprint::topology_fingerprint;
use crate::instantiate::InstantiateOptions;
use crate::provider::ResourceProvider;
use crate::update;

static NEXT_EXEC: AtomicU64 = AtomicU64::new(1);

/// Unique id of an executable within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecId(pub u64);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec{}", self.0)
    }
}

pub struct Executable {
    /// Snapshot of the source graph, kept in step with the program by updates.
    pub(crate) snapshot: Graph,
    pub(crate) program: Arc<CompiledProgram>,
    pub(crate) fingerprint: blake3::Hash,
    shared: Arc<ExecShared>,
}

impl Executable {
    pub(crate) fn new(graph: &Graph, program: CompiledProgram, shared: ExecShared) -> Self {
        Executable {
            snapshot: graph.snapshot(),
            program: Arc::new(program),
            fingerprint: topology_fingerprint(graph),
            shared: Arc::new(shared),
        }
    }

    pub fn id(&self) -> ExecId {
        self.shared.id
    }

    /// The graph this executable was instantiated from, with every
    /// successful update applied.
    pub fn source_graph(&self) -> &Graph {
        &self.snapshot
    }

    /// The current compiled program. Replays clone this at launch time.
    pub fn program(&self) -> Arc<CompiledProgram> {
        Arc::clone(&self.program)
    }

    pub fn shared(&self) -> &Arc<ExecShared> {
        &self.shared
    }

    pub fn fingerprint(&self) -> blake3::Hash {
        self.fingerprint
    }

    pub fn options(&self) -> &InstantiateOptions {
        &self.shared.options
    }

    pub fn node_count(&self) -> usize {
        self.program.len()
    }

    /// Compiled index of a node of the source graph, in O(1).
    pub fn compiled_index(&self, node: NodeId) -> Option<usize> {
        self.program.index_of(node)
    }

    /// Current parameters of a node of the source graph.
    pub fn node_params(&self, node: NodeId) -> Option<&NodeParams> {
        let id = self.snapshot.find_in_clone(node)?;
        self.snapshot.node(id).ok().map(|n| &n.params)
    }

    pub fn is_node_enabled(&self, node: NodeId) -> Option<bool> {
        let index = self.program.index_of(node)?;
        self.program.node(index).map(|n| n.enabled)
    }

    /// Patches a single node, under the same per-kind rules as
    /// [`update`](Self::update). `node` is a node of the source graph.
    pub fn set_node_params(&mut self, node: NodeId, params: NodeParams) -> Result<(), UpdateError> {
        let (index, local) = self.locate(node)?;
        let old = match self.snapshot.node(local) {
            Ok(n) => &n.params,
            Err(_) => return Err(not_supported(node)),
        };
        let current = &self.program.nodes()[index].op;
        let op = update::reconcile_node(old, &params, node, current)?;

        if !params.is_memory_node() {
            self.snapshot
                .set_node_params(local, params)
                .map_err(|_| UpdateError::new(UpdateErrorKind::ParametersChanged, Some(node)))?;
        }
        self.program = Arc::new(self.program.with_ops(vec![(index, op)]));
        debug!(exec = %self.id(), %node, "patched node parameters");
        Ok(())
    }

    /// Enables or disables a kernel, memcpy or memset node. A disabled node
    /// is skipped at replay but still orders its dependents.
    pub fn set_node_enabled(&mut self, node: NodeId, enabled: bool) -> Result<(), UpdateError> {
        let (index, _) = self.locate(node)?;
        let kind = self.program.nodes()[index].op.kind();
        if !matches!(kind, NodeKind::Kernel | NodeKind::Memcpy | NodeKind::Memset) {
            return Err(not_supported(node));
        }
        if self.program.nodes()[index].enabled != enabled {
            self.program = Arc::new(self.program.with_enabled(index, enabled));
            debug!(exec = %self.id(), %node, enabled, "toggled node");
        }
        Ok(())
    }

    /// Destroys the executable. Returns immediately; bindings and the lease
    /// are released once in-flight replays finish.
    pub fn destroy(self) {
        debug!(
            exec = %self.id(),
            in_flight = Arc::strong_count(&self.shared) - 1,
            "destroying executable"
        );
    }

    fn locate(&self, node: NodeId) -> Result<(usize, NodeId), UpdateError> {
        let index = self.program.index_of(node).ok_or_else(|| not_supported(node))?;
        let local = self
            .snapshot
            .find_in_clone(node)
            .ok_or_else(|| not_supported(node))?;
        Ok((index, local))
    }
}

impl fmt::Debug for Executable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executable")
            .field("id", &self.id())
            .field("nodes", &self.program.len())
            .field("fingerprint", &self.fingerprint.to_hex().as_str())
            .finish()
    }
}

fn not_supported(node: NodeId) -> UpdateError {
    UpdateError::new(UpdateErrorKind::NotSupported, Some(node))
}

/// Replay-side state shared between an executable and its in-flight replays.
pub struct ExecShared {
    id: ExecId,
    options: InstantiateOptions,
    provider: Arc<dyn ResourceProvider>,
    bindings: Vec<DevicePtr>,
    _leases: Vec<LeaseGuard>,
    replay_gate: Semaphore,
    live_allocations: Mutex<BTreeSet<DevicePtr>>,
    launches: AtomicU64,
    uploaded: AtomicBool,
}

impl ExecShared {
    pub(crate) fn new(
        options: InstantiateOptions,
        provider: Arc<dyn ResourceProvider>,
        bindings: Vec<DevicePtr>,
        leases: Vec<LeaseGuard>,
    ) -> Self {
        ExecShared {
            id: ExecId(NEXT_EXEC.fetch_add(1, Ordering::Relaxed)),
            options,
            provider,
            bindings,
            _leases: leases,
            replay_gate: Semaphore::new(1),
            live_allocations: Mutex::new(BTreeSet::new()),
            launches: AtomicU64::new(0),
            uploaded: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ExecId {
        self.id
    }

    pub fn options(&self) -> &InstantiateOptions {
        &self.options
    }

    /// Admits one physical replay (or upload) at a time.
    pub fn replay_gate(&self) -> &Semaphore {
        &self.replay_gate
    }

    /// Allocates the sequence number of the next launch, starting at 1.
    pub fn next_launch(&self) -> u64 {
        self.launches.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Marks the program resident. Returns `false` if it already was.
    pub fn mark_uploaded(&self) -> bool {
        !self.uploaded.swap(true, Ordering::AcqRel)
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn note_allocated(&self, address: DevicePtr) {
        self.live().insert(address);
    }

    /// Returns `false` if the address was not live.
    pub fn note_freed(&self, address: DevicePtr) -> bool {
        self.live().remove(&address)
    }

    /// Allocations made by earlier replays that were never freed.
    pub fn outstanding_allocations(&self) -> Vec<DevicePtr> {
        self.live().iter().copied().collect()
    }

    /// Frees every outstanding allocation, returning them.
    pub fn reclaim_allocations(&self) -> Vec<DevicePtr> {
        std::mem::take(&mut *self.live()).into_iter().collect()
    }

    fn live(&self) -> std::sync::MutexGuard<'_, BTreeSet<DevicePtr>> {
        self.live_allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ExecShared {
    fn drop(&mut self) {
        for address in &self.bindings {
            self.provider.release_allocation(*address);
        }
        debug!(exec = %self.id, bindings = self.bindings.len(), "released executable resources");
    }
}

impl fmt::Debug for ExecShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecShared")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("bindings", &self.bindings)
            .field("launches", &self.launch_count())
            .finish_non_exhaustive()
    }
}
