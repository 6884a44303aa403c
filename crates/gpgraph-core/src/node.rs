//! Node kinds and their parameter blocks.
//!
//! [`NodeParams`] is a closed sum type: every per-kind rule (validation,
//! update compatibility, lowering) matches on it exhaustively, so adding a
//! kind is a compile error everywhere it needs handling.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::address::MAX_ALLOCATION;
use crate::error::StructuralError;
use crate::graph::Graph;
use crate::id::{
    DeviceOrdinal, DevicePtr, EventHandle, FunctionHandle, MemorySpace, NodeId, ResourceRef,
    SemaphoreHandle,
};

// ---------------------------------------------------------------------------
// Kind discriminant
// ---------------------------------------------------------------------------

/// Discriminant of [`NodeParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Kernel,
    Memcpy,
    Memset,
    Host,
    ChildGraph,
    EventRecord,
    EventWait,
    SemaphoreSignal,
    SemaphoreWait,
    MemAlloc,
    MemFree,
    Empty,
}

impl NodeKind {
    /// Stable numeric tag, used in topology fingerprints.
    pub fn tag(self) -> u8 {
        match self {
            NodeKind::Kernel => 0,
            NodeKind::Memcpy => 1,
            NodeKind::Memset => 2,
            NodeKind::Host => 3,
            NodeKind::ChildGraph => 4,
            NodeKind::EventRecord => 5,
            NodeKind::EventWait => 6,
            NodeKind::SemaphoreSignal => 7,
            NodeKind::SemaphoreWait => 8,
            NodeKind::MemAlloc => 9,
            NodeKind::MemFree => 10,
            NodeKind::Empty => 11,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Kernel => "kernel",
            NodeKind::Memcpy => "memcpy",
            NodeKind::Memset => "memset",
            NodeKind::Host => "host",
            NodeKind::ChildGraph => "child_graph",
            NodeKind::EventRecord => "event_record",
            NodeKind::EventWait => "event_wait",
            NodeKind::SemaphoreSignal => "semaphore_signal",
            NodeKind::SemaphoreWait => "semaphore_wait",
            NodeKind::MemAlloc => "mem_alloc",
            NodeKind::MemFree => "mem_free",
            NodeKind::Empty => "empty",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Launch dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    pub fn linear(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    /// Total number of elements (blocks or threads), saturating.
    pub fn volume(&self) -> u64 {
        (self.x as u64 * self.y as u64).saturating_mul(self.z as u64)
    }
}

/// Kernel launch parameters. The argument buffer is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParams {
    pub function: FunctionHandle,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    pub args: Vec<u8>,
}

impl KernelParams {
    pub fn new(function: FunctionHandle, grid: Dim3, block: Dim3) -> Self {
        KernelParams {
            function,
            grid,
            block,
            shared_mem_bytes: 0,
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<u8>) -> Self {
        self.args = args;
        self
    }
}

// ---------------------------------------------------------------------------
// Memcpy / memset
// ---------------------------------------------------------------------------

/// One end of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemLocation {
    pub ptr: DevicePtr,
    pub space: MemorySpace,
}

impl MemLocation {
    pub fn device(ptr: DevicePtr, ordinal: DeviceOrdinal) -> Self {
        MemLocation {
            ptr,
            space: MemorySpace::Device(ordinal),
        }
    }

    pub fn host(ptr: DevicePtr) -> Self {
        MemLocation {
            ptr,
            space: MemorySpace::Host,
        }
    }
}

/// Shape of a copy. Dimensionality is part of the node's identity for
/// updates, so it is explicit rather than inferred from extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyShape {
    Linear {
        bytes: u64,
    },
    Pitched {
        width_bytes: u64,
        height: u64,
        src_pitch: u64,
        dst_pitch: u64,
    },
}

impl CopyShape {
    pub fn dimensionality(&self) -> u8 {
        match self {
            CopyShape::Linear { .. } => 1,
            CopyShape::Pitched { .. } => 2,
        }
    }

    /// Bytes spanned on the source side, or `None` on overflow.
    pub fn checked_src_span(&self) -> Option<u64> {
        match *self {
            CopyShape::Linear { bytes } => Some(bytes),
            CopyShape::Pitched {
                width_bytes,
                height,
                src_pitch,
                ..
            } => pitched_span(width_bytes, height, src_pitch),
        }
    }

    /// Bytes spanned on the destination side, or `None` on overflow.
    pub fn checked_dst_span(&self) -> Option<u64> {
        match *self {
            CopyShape::Linear { bytes } => Some(bytes),
            CopyShape::Pitched {
                width_bytes,
                height,
                dst_pitch,
                ..
            } => pitched_span(width_bytes, height, dst_pitch),
        }
    }

    /// Bytes spanned on the source side. Saturates for shapes
    /// [`NodeParams::validate`] rejects.
    pub fn src_span(&self) -> u64 {
        self.checked_src_span().unwrap_or(u64::MAX)
    }

    /// Bytes spanned on the destination side. Saturates for shapes
    /// [`NodeParams::validate`] rejects.
    pub fn dst_span(&self) -> u64 {
        self.checked_dst_span().unwrap_or(u64::MAX)
    }
}

fn pitched_span(width_bytes: u64, height: u64, pitch: u64) -> Option<u64> {
    match height {
        0 => Some(0),
        _ => pitch.checked_mul(height - 1)?.checked_add(width_bytes),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemcpyParams {
    pub src: MemLocation,
    pub dst: MemLocation,
    pub shape: CopyShape,
}

impl MemcpyParams {
    pub fn linear(src: MemLocation, dst: MemLocation, bytes: u64) -> Self {
        MemcpyParams {
            src,
            dst,
            shape: CopyShape::Linear { bytes },
        }
    }
}

/// Shape of a memset, in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetShape {
    Linear { count: u64 },
    Pitched { width: u64, height: u64, pitch_bytes: u64 },
}

impl SetShape {
    pub fn dimensionality(&self) -> u8 {
        match self {
            SetShape::Linear { .. } => 1,
            SetShape::Pitched { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemsetParams {
    pub dst: DevicePtr,
    pub device: DeviceOrdinal,
    pub value: u32,
    /// Element size in bytes: 1, 2 or 4.
    pub element_size: u8,
    pub shape: SetShape,
}

impl MemsetParams {
    pub fn bytes(dst: DevicePtr, device: DeviceOrdinal, value: u8, count: u64) -> Self {
        MemsetParams {
            dst,
            device,
            value: value as u32,
            element_size: 1,
            shape: SetShape::Linear { count },
        }
    }

    /// Bytes spanned at the destination, or `None` on overflow.
    pub fn checked_span(&self) -> Option<u64> {
        let elem = self.element_size as u64;
        match self.shape {
            SetShape::Linear { count } => count.checked_mul(elem),
            SetShape::Pitched {
                width,
                height,
                pitch_bytes,
            } => pitched_span(width.checked_mul(elem)?, height, pitch_bytes),
        }
    }

    /// Bytes spanned at the destination. Saturates for shapes
    /// [`NodeParams::validate`] rejects.
    pub fn span(&self) -> u64 {
        self.checked_span().unwrap_or(u64::MAX)
    }
}

// ---------------------------------------------------------------------------
// Host callbacks
// ---------------------------------------------------------------------------

/// What a host callback gets to see. Carries no queue, graph or executable
/// handle: callbacks must not call back into the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCallbackContext {
    /// The graph node being executed; `None` for eager submissions.
    pub node: Option<NodeId>,
    /// Sequence number of the launch this invocation belongs to (0 when eager).
    pub launch: u64,
}

pub type HostFn = Arc<dyn Fn(&HostCallbackContext) + Send + Sync>;

#[derive(Clone)]
pub struct HostParams {
    pub callback: HostFn,
    pub label: Option<String>,
}

impl HostParams {
    pub fn new(callback: impl Fn(&HostCallbackContext) + Send + Sync + 'static) -> Self {
        HostParams {
            callback: Arc::new(callback),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Debug for HostParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostParams")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Child graphs, semaphores, memory nodes
// ---------------------------------------------------------------------------

/// A child graph is embedded by value: the parent owns its own deep copy.
#[derive(Debug, Clone)]
pub struct ChildGraphParams {
    pub graph: Box<Graph>,
}

impl ChildGraphParams {
    /// Embeds a clone of `graph`.
    pub fn new(graph: &Graph) -> Self {
        ChildGraphParams {
            graph: Box::new(graph.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreParams {
    pub semaphores: Vec<SemaphoreHandle>,
    /// One value per semaphore.
    pub values: Vec<u64>,
}

impl SemaphoreParams {
    pub fn single(semaphore: SemaphoreHandle, value: u64) -> Self {
        SemaphoreParams {
            semaphores: vec![semaphore],
            values: vec![value],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAllocParams {
    pub size: u64,
    pub device: DeviceOrdinal,
    /// Virtual address of the allocation. Reserved by the graph when the node
    /// is added with `None`.
    pub address: Option<DevicePtr>,
}

impl MemAllocParams {
    pub fn new(size: u64, device: DeviceOrdinal) -> Self {
        MemAllocParams {
            size,
            device,
            address: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemFreeParams {
    pub address: DevicePtr,
}

// ---------------------------------------------------------------------------
// NodeParams
// ---------------------------------------------------------------------------

/// Kind-specific parameter block of a node.
#[derive(Debug, Clone)]
pub enum NodeParams {
    Kernel(KernelParams),
    Memcpy(MemcpyParams),
    Memset(MemsetParams),
    Host(HostParams),
    ChildGraph(ChildGraphParams),
    EventRecord(EventHandle),
    EventWait(EventHandle),
    SemaphoreSignal(SemaphoreParams),
    SemaphoreWait(SemaphoreParams),
    MemAlloc(MemAllocParams),
    MemFree(MemFreeParams),
    Empty,
}

impl NodeParams {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeParams::Kernel(_) => NodeKind::Kernel,
            NodeParams::Memcpy(_) => NodeKind::Memcpy,
            NodeParams::Memset(_) => NodeKind::Memset,
            NodeParams::Host(_) => NodeKind::Host,
            NodeParams::ChildGraph(_) => NodeKind::ChildGraph,
            NodeParams::EventRecord(_) => NodeKind::EventRecord,
            NodeParams::EventWait(_) => NodeKind::EventWait,
            NodeParams::SemaphoreSignal(_) => NodeKind::SemaphoreSignal,
            NodeParams::SemaphoreWait(_) => NodeKind::SemaphoreWait,
            NodeParams::MemAlloc(_) => NodeKind::MemAlloc,
            NodeParams::MemFree(_) => NodeKind::MemFree,
            NodeParams::Empty => NodeKind::Empty,
        }
    }

    /// Returns `true` for stream-ordered allocation and free nodes.
    pub fn is_memory_node(&self) -> bool {
        matches!(self, NodeParams::MemAlloc(_) | NodeParams::MemFree(_))
    }

    /// Checks the parameter block is well formed.
    pub fn validate(&self) -> Result<(), StructuralError> {
        match self {
            NodeParams::Kernel(k) => {
                if k.grid.volume() == 0 || k.block.volume() == 0 {
                    return Err(invalid("kernel launch dimensions must be non-zero"));
                }
            }
            NodeParams::Memcpy(c) => {
                if let CopyShape::Pitched {
                    width_bytes,
                    src_pitch,
                    dst_pitch,
                    ..
                } = c.shape
                {
                    if width_bytes > src_pitch || width_bytes > dst_pitch {
                        return Err(invalid("copy width exceeds pitch"));
                    }
                }
                let src = c.shape.checked_src_span();
                let dst = c.shape.checked_dst_span();
                check_range(c.src.ptr, src, "copy source")?;
                check_range(c.dst.ptr, dst, "copy destination")?;
            }
            NodeParams::Memset(s) => {
                if !matches!(s.element_size, 1 | 2 | 4) {
                    return Err(invalid("memset element size must be 1, 2 or 4"));
                }
                if s.element_size < 4 && s.value >> (8 * s.element_size as u32) != 0 {
                    return Err(invalid("memset value does not fit the element size"));
                }
                if let SetShape::Pitched {
                    width, pitch_bytes, ..
                } = s.shape
                {
                    match width.checked_mul(s.element_size as u64) {
                        None => return Err(invalid("memset row overflows")),
                        Some(row) if row > pitch_bytes => {
                            return Err(invalid("memset width exceeds pitch"))
                        }
                        Some(_) => {}
                    }
                }
                check_range(s.dst, s.checked_span(), "memset destination")?;
            }
            NodeParams::SemaphoreSignal(p) | NodeParams::SemaphoreWait(p) => {
                if p.semaphores.is_empty() {
                    return Err(invalid("semaphore node needs at least one semaphore"));
                }
                if p.semaphores.len() != p.values.len() {
                    return Err(invalid("semaphore and value arrays differ in length"));
                }
            }
            NodeParams::MemAlloc(a) => {
                if a.size == 0 {
                    return Err(invalid("allocation size must be non-zero"));
                }
                if a.size > MAX_ALLOCATION {
                    return Err(invalid("allocation size exceeds the virtual window"));
                }
            }
            NodeParams::Host(_)
            | NodeParams::ChildGraph(_)
            | NodeParams::EventRecord(_)
            | NodeParams::EventWait(_)
            | NodeParams::MemFree(_)
            | NodeParams::Empty => {}
        }
        Ok(())
    }

    /// External handles this node refers to (not recursing into child graphs).
    pub fn resources(&self) -> SmallVec<[ResourceRef; 2]> {
        match self {
            NodeParams::Kernel(k) => smallvec![ResourceRef::Function(k.function)],
            NodeParams::EventRecord(e) | NodeParams::EventWait(e) => {
                smallvec![ResourceRef::Event(*e)]
            }
            NodeParams::SemaphoreSignal(p) | NodeParams::SemaphoreWait(p) => p
                .semaphores
                .iter()
                .map(|s| ResourceRef::Semaphore(*s))
                .collect(),
            _ => SmallVec::new(),
        }
    }

    /// Memory ranges `(base, len)` this node statically reads or writes.
    /// Kernel arguments are opaque, so kernels report nothing.
    pub fn accessed_ranges(&self) -> SmallVec<[(DevicePtr, u64); 2]> {
        match self {
            NodeParams::Memcpy(c) => smallvec![
                (c.src.ptr, c.shape.src_span()),
                (c.dst.ptr, c.shape.dst_span())
            ],
            NodeParams::Memset(s) => smallvec![(s.dst, s.span())],
            _ => SmallVec::new(),
        }
    }
}

/// `base + span` must stay inside the address space.
fn check_range(base: DevicePtr, span: Option<u64>, what: &str) -> Result<(), StructuralError> {
    match span.and_then(|span| base.checked_offset(span)) {
        Some(_) => Ok(()),
        None => Err(StructuralError::InvalidParameters {
            reason: format!("{} range overflows the address space", what),
        }),
    }
}

fn invalid(reason: &str) -> StructuralError {
    StructuralError::InvalidParameters {
        reason: reason.to_string(),
    }
}

/// A node stored in a graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub params: NodeParams,
}

impl Node {
    pub fn new(params: NodeParams) -> Self {
        Node { params }
    }

    pub fn kind(&self) -> NodeKind {
        self.params.kind()
    }
}
