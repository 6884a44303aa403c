//! Error types for capture, instantiation and update.
//!
//! Every variant that can be localized carries the offending [`NodeId`].
//! Failed instantiation leaves the graph untouched; failed update leaves the
//! executable untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gpgraph_core::{DevicePtr, EventHandle, NodeId, ResourceRef, StructuralError};

use crate::capture::{CaptureId, QueueId};
use crate::diagnostics::DiagnosticLog;

/// A problem found while validating a graph for instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The graph is cyclic; `node` is one of the nodes left unordered.
    #[error("cycle through node {node}")]
    Cycle { node: NodeId },

    /// A free targets an address no alloc node of the same graph produced.
    #[error("free node {node} targets {address}, which no alloc node in this graph produces")]
    FreeWithoutAlloc { node: NodeId, address: DevicePtr },

    /// A second free of the same address.
    #[error("free node {node} frees {address} a second time")]
    DoubleFree { node: NodeId, address: DevicePtr },

    /// The free is not ordered after its alloc.
    #[error("free node {node} is not ordered after alloc node {alloc}")]
    FreeBeforeAlloc { node: NodeId, alloc: NodeId },

    /// A memcpy/memset touches an allocation outside its alloc..free window.
    #[error("node {node} accesses allocation {address} outside its lifetime")]
    UseOutsideLifetime { node: NodeId, address: DevicePtr },

    /// An external handle is no longer live.
    #[error("node {node} refers to released {resource}")]
    StaleHandle { node: NodeId, resource: ResourceRef },

    /// Another executable of this graph holding memory nodes is alive.
    #[error("graph already has a live executable{}", fmt_node(.node))]
    AlreadyInstantiated { node: Option<NodeId> },

    /// A parameter block failed validation.
    #[error("node {node} has invalid parameters: {reason}")]
    InvalidParameters { node: NodeId, reason: String },
}

impl ValidationError {
    /// The node the problem is attributed to, when it can be localized.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            ValidationError::Cycle { node }
            | ValidationError::FreeWithoutAlloc { node, .. }
            | ValidationError::DoubleFree { node, .. }
            | ValidationError::FreeBeforeAlloc { node, .. }
            | ValidationError::UseOutsideLifetime { node, .. }
            | ValidationError::StaleHandle { node, .. }
            | ValidationError::InvalidParameters { node, .. } => Some(*node),
            ValidationError::AlreadyInstantiated { node } => *node,
        }
    }
}

/// Failures of the raw memory provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("address {address} is already backed")]
    AddressInUse { address: DevicePtr },

    #[error("unknown address {address}")]
    UnknownAddress { address: DevicePtr },
}

/// Instantiation failure. No executable is produced.
#[derive(Debug, Clone, Error)]
pub enum InstantiateError {
    /// The graph failed validation. `error` is the first problem found; the
    /// log holds all of them.
    #[error("instantiation failed: {error}")]
    Validation {
        error: ValidationError,
        log: DiagnosticLog,
    },

    /// Physical backing for an alloc node could not be bound.
    #[error("instantiation failed: {0}")]
    Resource(#[from] ResourceError),
}

impl InstantiateError {
    /// The offending node, when the failure can be localized.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            InstantiateError::Validation { error, .. } => error.node(),
            InstantiateError::Resource(_) => None,
        }
    }

    pub fn log(&self) -> Option<&DiagnosticLog> {
        match self {
            InstantiateError::Validation { log, .. } => Some(log),
            InstantiateError::Resource(_) => None,
        }
    }
}

/// Why an executable update was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateErrorKind {
    TopologyChanged,
    ParametersChanged,
    FunctionChanged,
    NotSupported,
}

impl fmt::Display for UpdateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdateErrorKind::TopologyChanged => "topology changed",
            UpdateErrorKind::ParametersChanged => "parameters changed",
            UpdateErrorKind::FunctionChanged => "function changed",
            UpdateErrorKind::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// An update was refused; the executable is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("update rejected: {kind}{}", fmt_node(.node))]
pub struct UpdateError {
    pub kind: UpdateErrorKind,
    /// The first offending node of the candidate graph.
    pub node: Option<NodeId>,
}

impl UpdateError {
    pub fn new(kind: UpdateErrorKind, node: Option<NodeId>) -> Self {
        UpdateError { kind, node }
    }

    pub(crate) fn topology(node: Option<NodeId>) -> Self {
        UpdateError::new(UpdateErrorKind::TopologyChanged, node)
    }
}

/// Why a capture session was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// A capturing queue was synchronized.
    Synchronized { queue: QueueId },
    /// A queue waited on an event recorded by another capture session.
    CrossCaptureWait { queue: QueueId, event: EventHandle },
    /// A capturing queue waited on an event last recorded by uncaptured work.
    UncapturedWait { queue: QueueId, event: EventHandle },
    /// A potentially unsafe call conflicted with the capture.
    UnsafeCall { operation: String },
    /// `end_capture` was called on a joined branch instead of the origin.
    EndedOnBranch { queue: QueueId },
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Synchronized { queue } => {
                write!(f, "queue {} was synchronized during capture", queue)
            }
            InvalidationReason::CrossCaptureWait { queue, event } => write!(
                f,
                "queue {} waited on event {} from another capture",
                queue, event
            ),
            InvalidationReason::UncapturedWait { queue, event } => write!(
                f,
                "queue {} waited on event {} recorded outside capture",
                queue, event
            ),
            InvalidationReason::UnsafeCall { operation } => {
                write!(f, "unsafe call during capture: {}", operation)
            }
            InvalidationReason::EndedOnBranch { queue } => {
                write!(f, "end_capture called on joined queue {}", queue)
            }
        }
    }
}

/// Errors from the capture controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The queue already belongs to a capture session.
    #[error("queue {queue} is already capturing")]
    AlreadyCapturing { queue: QueueId },

    /// The legacy queue cannot capture.
    #[error("queue {queue} is the legacy queue and cannot capture")]
    LegacyQueue { queue: QueueId },

    #[error("queue {queue} is not capturing")]
    NotCapturing { queue: QueueId },

    /// `end_capture` on a queue that joined the session instead of starting it.
    #[error("queue {queue} did not begin capture {capture} (origin is queue {origin})")]
    NotOrigin {
        queue: QueueId,
        origin: QueueId,
        capture: CaptureId,
    },

    /// The session was invalidated by an illegal action.
    #[error("capture invalidated: {reason}")]
    Invalidated { reason: InvalidationReason },

    /// An unsafe call conflicted with an active capture, which is now invalidated.
    #[error("{operation} is not permitted while capture {capture} is active")]
    UnsafeDuringCapture { operation: String, capture: CaptureId },

    #[error(transparent)]
    Structural(#[from] StructuralError),
}

fn fmt_node(node: &Option<NodeId>) -> String {
    match node {
        Some(node) => format!(" at node {}", node),
        None => String::new(),
    }
}
