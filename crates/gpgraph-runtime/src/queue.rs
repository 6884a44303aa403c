//! Queues: ordered asynchronous execution channels.
//!
//! Each queue is a worker task on the device runtime draining an unbounded
//! FIFO of work. Submissions return as soon as the work is enqueued, or,
//! while the queue is capturing, as soon as it has been recorded into the
//! capture graph. Ordering across queues comes only from events.
//!
//! A fault stops the queue: later work is skipped (event records still
//! complete so other queues are not left waiting) and `synchronize` keeps
//! returning the fault.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use gpgraph_core::address;
use gpgraph_core::{
    ChildGraphParams, DevicePtr, Dim3, EventHandle, FunctionHandle, Graph, HostCallbackContext,
    HostParams, KernelParams, MemAllocParams, MemFreeParams, MemcpyParams, MemsetParams, NodeId,
    NodeParams, SemaphoreParams, StructuralError,
};
use gpgraph_exec::{
    CaptureId, CaptureMode, CaptureStatus, CompiledOp, CompiledProgram, DependencyUpdate,
    ExecShared, Executable, QueueId, WaitOutcome,
};

use crate::callback::ensure_control_plane;
use crate::device::DeviceInner;
use crate::error::{DeviceFault, QueueError};
use crate::replay;
use crate::sync::EventState;

/// One unit of queued work.
pub(crate) enum Work {
    Op(CompiledOp),
    RecordEvent {
        event: Arc<EventState>,
        seq: u64,
    },
    WaitEvent {
        event: Arc<EventState>,
        target: u64,
    },
    Launch {
        exec: Arc<ExecShared>,
        program: Arc<CompiledProgram>,
        launch: u64,
    },
    Upload {
        exec: Arc<ExecShared>,
    },
    Alloc {
        address: DevicePtr,
        size: u64,
    },
    Free {
        address: DevicePtr,
    },
}

type Fault = Arc<Mutex<Option<DeviceFault>>>;

pub(crate) struct QueueShared {
    id: QueueId,
    legacy: bool,
    sender: mpsc::UnboundedSender<Work>,
    submitted: AtomicU64,
    completed: watch::Receiver<u64>,
    fault: Fault,
}

impl QueueShared {
    /// Blocks until everything submitted so far has run, then reports the
    /// queue's fault, if any.
    pub(crate) fn wait_idle(&self, device: &DeviceInner) -> Result<(), QueueError> {
        let target = self.submitted.load(Ordering::Acquire);
        let mut completed = self.completed.clone();
        let reached = device
            .handle
            .block_on(async move { completed.wait_for(|done| *done >= target).await.is_ok() });
        if let Some(fault) = self.fault() {
            return Err(fault.into());
        }
        if !reached {
            return Err(QueueError::Closed { queue: self.id });
        }
        Ok(())
    }

    fn fault(&self) -> Option<DeviceFault> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to a queue. Clones refer to the same queue; the worker stops once
/// every handle is dropped and the pending work has run.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
    device: Arc<DeviceInner>,
}

impl Queue {
    pub(crate) fn spawn(device: &Arc<DeviceInner>, legacy: bool) -> Queue {
        let id = QueueId(device.next_queue_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        let (progress, completed) = watch::channel(0);
        let fault: Fault = Arc::new(Mutex::new(None));

        device.handle.spawn(run_worker(
            Arc::clone(device),
            id,
            receiver,
            progress,
            Arc::clone(&fault),
        ));

        let shared = Arc::new(QueueShared {
            id,
            legacy,
            sender,
            submitted: AtomicU64::new(0),
            completed,
            fault,
        });
        device.register_queue(&shared);
        debug!(queue = %id, legacy, "queue created");
        Queue {
            shared,
            device: Arc::clone(device),
        }
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn is_legacy(&self) -> bool {
        self.shared.legacy
    }

    /// The fault that stopped this queue, if any.
    pub fn fault(&self) -> Option<DeviceFault> {
        self.shared.fault()
    }

    /// `true` once every submitted item has run.
    pub fn is_idle(&self) -> bool {
        *self.shared.completed.borrow() >= self.shared.submitted.load(Ordering::Acquire)
    }

    // -- submission -----------------------------------------------------------

    /// Submits one command. While capturing, the command becomes a node of
    /// the capture graph and its id is returned; otherwise it is enqueued for
    /// execution and `None` is returned.
    pub fn submit(&self, params: NodeParams) -> Result<Option<NodeId>, QueueError> {
        self.enter()?;
        if self.is_capturing() {
            let node = self.device.capture.submit(self.id(), params)?;
            return Ok(Some(node));
        }

        params.validate()?;
        let work = match params {
            NodeParams::Kernel(k) => Work::Op(CompiledOp::Kernel(k)),
            NodeParams::Memcpy(c) => Work::Op(CompiledOp::Memcpy(c)),
            NodeParams::Memset(s) => Work::Op(CompiledOp::Memset(s)),
            NodeParams::Host(h) => Work::Op(CompiledOp::Host(h)),
            NodeParams::SemaphoreSignal(p) => Work::Op(CompiledOp::SemaphoreSignal(p)),
            NodeParams::SemaphoreWait(p) => Work::Op(CompiledOp::SemaphoreWait(p)),
            NodeParams::Empty => Work::Op(CompiledOp::Empty),
            NodeParams::EventRecord(event) => {
                self.record_event(event)?;
                return Ok(None);
            }
            NodeParams::EventWait(event) => {
                self.wait_event(event)?;
                return Ok(None);
            }
            NodeParams::MemAlloc(a) => Work::Alloc {
                address: a.address.unwrap_or_else(|| address::reserve(a.size)),
                size: a.size,
            },
            NodeParams::MemFree(f) => Work::Free { address: f.address },
            NodeParams::ChildGraph(_) => {
                return Err(StructuralError::Unsupported {
                    reason: "child graphs run only as part of an executable".to_string(),
                }
                .into())
            }
        };
        self.send(work)?;
        Ok(None)
    }

    pub fn launch_kernel(
        &self,
        function: FunctionHandle,
        grid: Dim3,
        block: Dim3,
        args: Vec<u8>,
    ) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::Kernel(
            KernelParams::new(function, grid, block).with_args(args),
        ))
    }

    pub fn memcpy(&self, params: MemcpyParams) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::Memcpy(params))
    }

    pub fn memset(&self, params: MemsetParams) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::Memset(params))
    }

    pub fn host_callback(
        &self,
        callback: impl Fn(&HostCallbackContext) + Send + Sync + 'static,
    ) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::Host(HostParams::new(callback)))
    }

    pub fn signal_semaphores(&self, params: SemaphoreParams) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::SemaphoreSignal(params))
    }

    pub fn wait_semaphores(&self, params: SemaphoreParams) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::SemaphoreWait(params))
    }

    /// Stream-ordered allocation. The address is reserved immediately; it
    /// is backed once the queue reaches the allocation.
    pub fn alloc_async(&self, size: u64) -> Result<DevicePtr, QueueError> {
        let address = address::reserve(size);
        let params = MemAllocParams {
            size,
            device: self.device.ordinal(),
            address: Some(address),
        };
        self.submit(NodeParams::MemAlloc(params))?;
        Ok(address)
    }

    pub fn free_async(&self, address: DevicePtr) -> Result<Option<NodeId>, QueueError> {
        self.submit(NodeParams::MemFree(MemFreeParams { address }))
    }

    // -- events ---------------------------------------------------------------

    /// Records `event` after all work submitted so far. While capturing,
    /// the event instead remembers the capture frontier.
    pub fn record_event(&self, event: EventHandle) -> Result<(), QueueError> {
        self.enter()?;
        let state = self.device.event(event)?;
        if self.device.capture.record_event(self.id(), event)? {
            return Ok(());
        }
        let seq = state.issue();
        self.send(Work::RecordEvent { event: state, seq })
    }

    /// Makes later work wait for the event's most recent record. Waiting on
    /// an event recorded inside a capture joins this queue to that capture.
    pub fn wait_event(&self, event: EventHandle) -> Result<(), QueueError> {
        self.enter()?;
        let state = self.device.event(event)?;
        match self.device.capture.wait_event(self.id(), event)? {
            WaitOutcome::Captured => Ok(()),
            WaitOutcome::Eager => {
                let target = state.latest();
                self.send(Work::WaitEvent {
                    event: state,
                    target,
                })
            }
        }
    }

    // -- executables ------------------------------------------------------------

    /// Enqueues a replay of `exec`. While capturing, the executable's graph
    /// is recorded as a child graph node instead.
    pub fn launch(&self, exec: &Executable) -> Result<(), QueueError> {
        self.enter()?;
        if self.is_capturing() {
            let child = NodeParams::ChildGraph(ChildGraphParams::new(exec.source_graph()));
            self.device.capture.submit(self.id(), child)?;
            return Ok(());
        }
        let shared = Arc::clone(exec.shared());
        let launch = shared.next_launch();
        debug!(queue = %self.id(), exec = %shared.id(), launch, "launch enqueued");
        self.send(Work::Launch {
            exec: shared,
            program: exec.program(),
            launch,
        })
    }

    /// Makes the executable resident ahead of its first launch.
    pub fn upload(&self, exec: &Executable) -> Result<(), QueueError> {
        self.enter()?;
        self.send(Work::Upload {
            exec: Arc::clone(exec.shared()),
        })
    }

    // -- capture ----------------------------------------------------------------

    pub fn begin_capture(&self, mode: CaptureMode) -> Result<CaptureId, QueueError> {
        ensure_control_plane()?;
        Ok(self.device.capture.begin(self.id(), mode)?)
    }

    pub fn end_capture(&self) -> Result<Graph, QueueError> {
        ensure_control_plane()?;
        Ok(self.device.capture.end(self.id())?)
    }

    pub fn is_capturing(&self) -> bool {
        self.device.capture.is_capturing(self.id())
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.device.capture.status(self.id())
    }

    pub fn update_capture_dependencies(
        &self,
        nodes: &[NodeId],
        update: DependencyUpdate,
    ) -> Result<(), QueueError> {
        ensure_control_plane()?;
        Ok(self
            .device
            .capture
            .update_dependencies(self.id(), nodes, update)?)
    }

    // -- synchronization ----------------------------------------------------------

    /// Blocks until all submitted work has run. Synchronizing a capturing
    /// queue invalidates its capture.
    ///
    /// Must not be called from inside an async runtime.
    pub fn synchronize(&self) -> Result<(), QueueError> {
        ensure_control_plane()?;
        self.device.capture.synchronize(self.id())?;
        self.shared.wait_idle(&self.device)
    }

    fn enter(&self) -> Result<(), QueueError> {
        ensure_control_plane()?;
        if self.shared.legacy {
            self.device.capture.check_unsafe("legacy queue submission")?;
        }
        Ok(())
    }

    fn send(&self, work: Work) -> Result<(), QueueError> {
        self.shared.submitted.fetch_add(1, Ordering::AcqRel);
        self.shared.sender.send(work).map_err(|_| {
            self.shared.submitted.fetch_sub(1, Ordering::AcqRel);
            QueueError::Closed { queue: self.id() }
        })
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id())
            .field("legacy", &self.shared.legacy)
            .field("submitted", &self.shared.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

async fn run_worker(
    device: Arc<DeviceInner>,
    queue: QueueId,
    mut receiver: mpsc::UnboundedReceiver<Work>,
    progress: watch::Sender<u64>,
    fault: Fault,
) {
    while let Some(work) = receiver.recv().await {
        let faulted = fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if faulted {
            if let Work::RecordEvent { event, seq } = work {
                event.complete(seq);
            }
        } else if let Err(err) = replay::execute_work(&device, work).await {
            error!(%queue, fault = %err, "queue faulted");
            *fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        }
        progress.send_modify(|done| *done += 1);
    }
    debug!(%queue, "queue worker stopped");
}
