//! Capture, instantiation and update of command graphs.
//!
//! - [`capture`]: the capture controller turning queue submissions into a
//!   [`Graph`](gpgraph_core::Graph).
//! - [`instantiate`](instantiate::instantiate): validation, lowering to a
//!   [`CompiledProgram`] and binding of allocation addresses.
//! - [`Executable`]: the replayable form, with per-node patching and
//!   whole-graph [`update`](Executable::update).
//!
//! The raw device is reached only through [`ResourceProvider`].

pub mod capture;
pub mod compiled;
pub mod diagnostics;
pub mod error;
pub mod executable;
pub mod fingerprint;
pub mod instantiate;
pub mod provider;
pub mod update;
pub mod validate;

pub use capture::{
    CaptureController, CaptureId, CaptureMode, CaptureState, CaptureStatus, DependencyUpdate,
    ModeGuard, ModeRegistry, QueueId, WaitOutcome,
};
pub use compiled::{CompiledNode, CompiledOp, CompiledProgram};
pub use diagnostics::{DiagnosticLog, DEFAULT_LOG_CAPACITY};
pub use error::{
    CaptureError, InstantiateError, InvalidationReason, ResourceError, UpdateError,
    UpdateErrorKind, ValidationError,
};
pub use executable::{ExecId, ExecShared, Executable};
pub use fingerprint::topology_fingerprint;
pub use instantiate::{instantiate, InstantiateOptions};
pub use provider::ResourceProvider;
pub use validate::validate_graph;
