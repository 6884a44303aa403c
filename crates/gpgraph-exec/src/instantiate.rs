//! Instantiation: validate, lower, bind.
//!
//! On success the caller owns an [`Executable`] that holds the graph's
//! instantiation lease (when it has memory nodes) and physical backing for
//! every alloc node. On failure nothing survives: leases taken so far are
//! dropped and bindings made so far are released in reverse order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gpgraph_core::{Graph, LeaseGuard, NodeId, NodeParams};

use crate::compiled::CompiledProgram;
use crate::diagnostics::{DiagnosticLog, DEFAULT_LOG_CAPACITY};
use crate::error::{InstantiateError, ValidationError};
use crate::executable::{ExecShared, Executable};
use crate::provider::ResourceProvider;
use crate::validate::validate_graph;

/// Options controlling instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantiateOptions {
    /// Free allocations left outstanding by the previous replay before the
    /// next one starts, instead of faulting.
    pub auto_free_on_launch: bool,

    /// Capacity of the diagnostic log in bytes, sentinel included.
    pub log_capacity: usize,
}

impl Default for InstantiateOptions {
    fn default() -> Self {
        InstantiateOptions {
            auto_free_on_launch: false,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Instantiates `graph` against `provider`.
pub fn instantiate(
    graph: &Graph,
    provider: Arc<dyn ResourceProvider>,
    options: &InstantiateOptions,
) -> Result<Executable, InstantiateError> {
    let mut errors = validate_graph(graph, provider.as_ref());

    let mut leases: Vec<LeaseGuard> = Vec::new();
    if let Err(err) = acquire_leases(graph, None, &mut leases) {
        errors.push(err);
    }
    if let Some(first) = errors.first().cloned() {
        return Err(validation_failure(first, &errors, options));
    }

    let program = match CompiledProgram::compile(graph) {
        Ok(program) => program,
        Err(err) => return Err(validation_failure(err.clone(), &[err], options)),
    };

    let mut bound = Vec::new();
    for (address, size, device) in program.allocations() {
        if let Err(err) = provider.bind_allocation(address, size, device) {
            for address in bound.iter().rev() {
                provider.release_allocation(*address);
            }
            warn!(graph = %graph.id(), error = %err, "instantiation failed to bind memory");
            return Err(InstantiateError::Resource(err));
        }
        bound.push(address);
    }

    let shared = ExecShared::new(options.clone(), provider, bound, leases);
    let exec = Executable::new(graph, program, shared);
    debug!(
        graph = %graph.id(),
        exec = %exec.id(),
        nodes = exec.node_count(),
        levels = exec.program().levels().len(),
        "instantiated graph"
    );
    Ok(exec)
}

/// Takes the lease of every memory-bearing graph level. `via` is the
/// top-level child-graph node a nested graph is reached through.
fn acquire_leases(
    graph: &Graph,
    via: Option<NodeId>,
    leases: &mut Vec<LeaseGuard>,
) -> Result<(), ValidationError> {
    if graph.contains_memory_nodes() {
        let guard = graph
            .lease()
            .try_acquire()
            .ok_or(ValidationError::AlreadyInstantiated { node: via })?;
        leases.push(guard);
    }
    for (id, node) in graph.nodes() {
        if let NodeParams::ChildGraph(child) = &node.params {
            acquire_leases(&child.graph, via.or(Some(id)), leases)?;
        }
    }
    Ok(())
}

fn validation_failure(
    error: ValidationError,
    all: &[ValidationError],
    options: &InstantiateOptions,
) -> InstantiateError {
    let mut log = DiagnosticLog::with_capacity(options.log_capacity);
    for err in all {
        log.push_line(&err.to_string());
    }
    warn!(
        error = %error,
        problems = all.len(),
        truncated = log.is_truncated(),
        "instantiation failed"
    );
    InstantiateError::Validation { error, log }
}
