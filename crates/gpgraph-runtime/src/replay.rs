//! Execution of queue work and executable replays.
//!
//! A replay spawns one task per node. Each task waits until all of its
//! predecessors have completed, so a node only ever waits on its own
//! dependencies and a wait can be satisfied by any independent branch. The
//! first fault aborts the nodes still pending and is reported.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;

use gpgraph_core::{
    EventHandle, HostCallbackContext, KernelParams, MemcpyParams, MemsetParams, NodeId,
    ResourceRef, SemaphoreParams,
};
use gpgraph_exec::{CompiledOp, CompiledProgram, ExecShared};

use crate::callback::run_host_callback;
use crate::device::DeviceInner;
use crate::error::DeviceFault;
use crate::kernel::KernelContext;
use crate::queue::Work;
use crate::sync::{EventState, SemaphoreState};

type ReplayFuture = Pin<Box<dyn Future<Output = Result<(), DeviceFault>> + Send>>;

/// Per-replay state threaded through nested programs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplayContext {
    /// The executable being replayed; `None` for eager work.
    exec: Option<Arc<ExecShared>>,
    launch: u64,
}

pub(crate) async fn execute_work(device: &Arc<DeviceInner>, work: Work) -> Result<(), DeviceFault> {
    match work {
        Work::Op(op) => execute_op(device, &op, None, &ReplayContext::default()).await,
        Work::RecordEvent { event, seq } => {
            event.complete(seq);
            Ok(())
        }
        Work::WaitEvent { event, target } => {
            event.wait_for(target).await;
            Ok(())
        }
        Work::Launch {
            exec,
            program,
            launch,
        } => replay(device, exec, program, launch).await,
        Work::Upload { exec } => {
            let _permit = exec.replay_gate().acquire().await;
            if exec.mark_uploaded() {
                debug!(exec = %exec.id(), "executable uploaded");
            }
            Ok(())
        }
        Work::Alloc { address, size } => device
            .memory()
            .bind(address, size)
            .map_err(|source| DeviceFault::Memory { node: None, source }),
        Work::Free { address } => device
            .memory()
            .free(address)
            .map_err(|_| DeviceFault::InvalidFree {
                node: None,
                address,
            }),
    }
}

async fn replay(
    device: &Arc<DeviceInner>,
    exec: Arc<ExecShared>,
    program: Arc<CompiledProgram>,
    launch: u64,
) -> Result<(), DeviceFault> {
    let _permit = exec.replay_gate().acquire().await;

    if let Some(address) = exec.outstanding_allocations().first().copied() {
        if !exec.options().auto_free_on_launch {
            return Err(DeviceFault::UnfreedAllocation {
                exec: exec.id(),
                address,
            });
        }
        let reclaimed = exec.reclaim_allocations();
        debug!(exec = %exec.id(), count = reclaimed.len(), "freed allocations of the previous launch");
    }
    exec.mark_uploaded();
    device.replays.fetch_add(1, Ordering::Relaxed);

    let context = ReplayContext {
        exec: Some(Arc::clone(&exec)),
        launch,
    };
    let outcome = run_program(Arc::clone(device), program, context).await;
    debug!(exec = %exec.id(), launch, ok = outcome.is_ok(), "replay finished");
    outcome
}

pub(crate) fn run_program(
    device: Arc<DeviceInner>,
    program: Arc<CompiledProgram>,
    context: ReplayContext,
) -> ReplayFuture {
    Box::pin(async move {
        if program.len() == 1 {
            return run_node(&device, &program, 0, &context).await;
        }

        // One completion flag per node; a dropped sender means the node
        // faulted or was skipped.
        let (done, finished): (Vec<_>, Vec<_>) =
            (0..program.len()).map(|_| watch::channel(false)).unzip();
        let mut tasks = JoinSet::new();
        for (index, done) in done.into_iter().enumerate() {
            let Some(node) = program.node(index) else {
                continue;
            };
            let predecessors: Vec<watch::Receiver<bool>> = node
                .deps
                .iter()
                .filter_map(|d| finished.get(*d as usize).cloned())
                .collect();
            let device = Arc::clone(&device);
            let program = Arc::clone(&program);
            let context = context.clone();
            tasks.spawn(async move {
                for mut predecessor in predecessors {
                    if predecessor.wait_for(|ok| *ok).await.is_err() {
                        return Ok(());
                    }
                }
                let outcome = run_node(&device, &program, index as u32, &context).await;
                if outcome.is_ok() {
                    done.send_replace(true);
                }
                outcome
            });
        }
        drop(finished);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(fault)) => {
                    tasks.abort_all();
                    return Err(fault);
                }
                Err(join) if join.is_cancelled() => {}
                Err(_) => {
                    tasks.abort_all();
                    return Err(DeviceFault::Aborted);
                }
            }
        }
        Ok(())
    })
}

async fn run_node(
    device: &Arc<DeviceInner>,
    program: &CompiledProgram,
    index: u32,
    context: &ReplayContext,
) -> Result<(), DeviceFault> {
    let Some(node) = program.node(index as usize) else {
        return Ok(());
    };
    if !node.enabled {
        return Ok(());
    }
    execute_op(device, &node.op, Some(node.source), context).await
}

async fn execute_op(
    device: &Arc<DeviceInner>,
    op: &CompiledOp,
    node: Option<NodeId>,
    context: &ReplayContext,
) -> Result<(), DeviceFault> {
    match op {
        CompiledOp::Kernel(params) => run_kernel(device, params, node),
        CompiledOp::Memcpy(params) => copy(device, params, node),
        CompiledOp::Memset(params) => set(device, params, node),
        CompiledOp::Host(host) => {
            let callback = HostCallbackContext {
                node,
                launch: context.launch,
            };
            run_host_callback(&device.host_slots, Arc::clone(&host.callback), callback).await
        }
        CompiledOp::Child(child) => {
            run_program(Arc::clone(device), Arc::clone(child), context.clone()).await
        }
        CompiledOp::EventRecord(event) => {
            event_state(device, *event, node)?.record_now();
            Ok(())
        }
        CompiledOp::EventWait(event) => {
            let state = event_state(device, *event, node)?;
            let target = state.latest();
            state.wait_for(target).await;
            Ok(())
        }
        CompiledOp::SemaphoreSignal(params) => {
            for (state, value) in semaphore_states(device, params, node)? {
                state.signal(value);
            }
            Ok(())
        }
        CompiledOp::SemaphoreWait(params) => {
            for (state, value) in semaphore_states(device, params, node)? {
                state.wait_for(value).await;
            }
            Ok(())
        }
        CompiledOp::MemAlloc { address, .. } => {
            if let Some(exec) = &context.exec {
                exec.note_allocated(*address);
            }
            Ok(())
        }
        CompiledOp::MemFree { address } => match &context.exec {
            Some(exec) if exec.note_freed(*address) => Ok(()),
            _ => Err(DeviceFault::InvalidFree {
                node,
                address: *address,
            }),
        },
        CompiledOp::Empty => Ok(()),
    }
}

fn run_kernel(
    device: &DeviceInner,
    params: &KernelParams,
    node: Option<NodeId>,
) -> Result<(), DeviceFault> {
    let entry = device
        .kernel(params.function)
        .ok_or(DeviceFault::StaleHandle {
            node,
            resource: ResourceRef::Function(params.function),
        })?;
    device.kernel_launches.fetch_add(1, Ordering::Relaxed);
    let Some(body) = entry.body else {
        return Ok(());
    };

    let mut context = KernelContext::new(node, params, &device.memory);
    let message = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut context))) {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(message)) => message,
        Err(_) => format!("kernel {} panicked", entry.name),
    };
    Err(DeviceFault::KernelFailed {
        node,
        function: params.function,
        message,
    })
}

fn copy(device: &DeviceInner, params: &MemcpyParams, node: Option<NodeId>) -> Result<(), DeviceFault> {
    device
        .memory()
        .copy(params)
        .map_err(|source| DeviceFault::Memory { node, source })
}

fn set(device: &DeviceInner, params: &MemsetParams, node: Option<NodeId>) -> Result<(), DeviceFault> {
    device
        .memory()
        .set(params)
        .map_err(|source| DeviceFault::Memory { node, source })
}

fn event_state(
    device: &DeviceInner,
    event: EventHandle,
    node: Option<NodeId>,
) -> Result<Arc<EventState>, DeviceFault> {
    device.event(event).map_err(|_| DeviceFault::StaleHandle {
        node,
        resource: ResourceRef::Event(event),
    })
}

fn semaphore_states(
    device: &DeviceInner,
    params: &SemaphoreParams,
    node: Option<NodeId>,
) -> Result<Vec<(Arc<SemaphoreState>, u64)>, DeviceFault> {
    params
        .semaphores
        .iter()
        .zip(&params.values)
        .map(|(semaphore, value)| {
            device
                .semaphore(*semaphore)
                .map(|state| (state, *value))
                .map_err(|_| DeviceFault::StaleHandle {
                    node,
                    resource: ResourceRef::Semaphore(*semaphore),
                })
        })
        .collect()
}
