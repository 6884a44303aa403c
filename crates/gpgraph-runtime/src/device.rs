//! The simulated device: context, memory, kernels, events, semaphores and
//! the runtime that drives its queues.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use gpgraph_core::{
    Arena, ContextHandle, DeviceOrdinal, DevicePtr, EventHandle, FunctionHandle, Graph,
    ResourceRef, SemaphoreHandle,
};
use gpgraph_exec::{
    CaptureController, CaptureMode, Executable, InstantiateOptions, ModeGuard, ResourceError,
    ResourceProvider,
};

use crate::callback::ensure_control_plane;
use crate::config::DeviceConfig;
use crate::error::QueueError;
use crate::kernel::{KernelEntry, KernelFn};
use crate::memory::SimulatedMemory;
use crate::queue::{Queue, QueueShared};
use crate::sync::{EventState, SemaphoreState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

/// Counters reported by [`Device::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStats {
    pub kernel_launches: u64,
    pub replays: u64,
    pub memory_used: u64,
    pub memory_capacity: u64,
    pub regions: usize,
}

/// State shared by the device handle, its queues and their workers.
pub(crate) struct DeviceInner {
    pub(crate) config: DeviceConfig,
    pub(crate) context: ContextHandle,
    pub(crate) memory: Mutex<SimulatedMemory>,
    kernels: RwLock<Arena<KernelEntry>>,
    events: RwLock<Arena<Arc<EventState>>>,
    semaphores: RwLock<Arena<Arc<SemaphoreState>>>,
    pub(crate) capture: CaptureController,
    pub(crate) handle: Handle,
    pub(crate) host_slots: Arc<Semaphore>,
    queues: Mutex<Vec<Weak<QueueShared>>>,
    next_queue: AtomicU32,
    pub(crate) kernel_launches: AtomicU64,
    pub(crate) replays: AtomicU64,
}

impl DeviceInner {
    pub(crate) fn ordinal(&self) -> DeviceOrdinal {
        DeviceOrdinal(self.config.ordinal)
    }

    pub(crate) fn memory(&self) -> MutexGuard<'_, SimulatedMemory> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn kernel(&self, function: FunctionHandle) -> Option<KernelEntry> {
        read(&self.kernels).get(function.0).cloned()
    }

    pub(crate) fn event(&self, event: EventHandle) -> Result<Arc<EventState>, QueueError> {
        read(&self.events)
            .get(event.0)
            .cloned()
            .ok_or(QueueError::UnknownHandle {
                resource: ResourceRef::Event(event),
            })
    }

    pub(crate) fn semaphore(
        &self,
        semaphore: SemaphoreHandle,
    ) -> Result<Arc<SemaphoreState>, QueueError> {
        read(&self.semaphores)
            .get(semaphore.0)
            .cloned()
            .ok_or(QueueError::UnknownHandle {
                resource: ResourceRef::Semaphore(semaphore),
            })
    }

    pub(crate) fn next_queue_id(&self) -> u32 {
        self.next_queue.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_queue(&self, queue: &Arc<QueueShared>) {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.retain(|q| q.strong_count() > 0);
        queues.push(Arc::downgrade(queue));
    }

    fn live_queues(&self) -> Vec<Arc<QueueShared>> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl ResourceProvider for DeviceInner {
    fn is_live(&self, resource: ResourceRef) -> bool {
        match resource {
            ResourceRef::Function(f) => read(&self.kernels).contains(f.0),
            ResourceRef::Event(e) => read(&self.events).contains(e.0),
            ResourceRef::Semaphore(s) => read(&self.semaphores).contains(s.0),
        }
    }

    fn bind_allocation(
        &self,
        address: DevicePtr,
        size: u64,
        _device: DeviceOrdinal,
    ) -> Result<(), ResourceError> {
        self.memory().bind(address, size)
    }

    fn release_allocation(&self, address: DevicePtr) {
        if let Err(err) = self.memory().free(address) {
            debug!(%address, error = %err, "allocation already released");
        }
    }
}

/// A simulated device with its own runtime. Dropping the device stops
/// every queue; work still pending is abandoned.
pub struct Device {
    inner: Arc<DeviceInner>,
    legacy: Queue,
    runtime: Option<Runtime>,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Result<Device, QueueError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .max_blocking_threads(config.max_host_callbacks.max(1))
            .thread_name("gpgraph-device")
            .build()?;

        let inner = Arc::new(DeviceInner {
            context: ContextHandle(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)),
            memory: Mutex::new(SimulatedMemory::new(config.memory_capacity)),
            kernels: RwLock::new(Arena::new()),
            events: RwLock::new(Arena::new()),
            semaphores: RwLock::new(Arena::new()),
            capture: CaptureController::new(),
            handle: runtime.handle().clone(),
            host_slots: Arc::new(Semaphore::new(config.max_host_callbacks.max(1))),
            queues: Mutex::new(Vec::new()),
            next_queue: AtomicU32::new(0),
            kernel_launches: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            config,
        });
        let legacy = Queue::spawn(&inner, true);
        inner.capture.register_legacy(legacy.id());

        info!(
            context = inner.context.0,
            ordinal = inner.config.ordinal,
            memory = inner.config.memory_capacity,
            workers = inner.config.worker_threads,
            "device ready"
        );
        Ok(Device {
            inner,
            legacy,
            runtime: Some(runtime),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn context(&self) -> ContextHandle {
        self.inner.context
    }

    pub fn ordinal(&self) -> DeviceOrdinal {
        self.inner.ordinal()
    }

    /// The legacy (null) queue. It cannot capture, and submitting to it
    /// counts as a potentially unsafe call while captures are active.
    pub fn default_queue(&self) -> &Queue {
        &self.legacy
    }

    pub fn create_queue(&self) -> Result<Queue, QueueError> {
        ensure_control_plane()?;
        Ok(Queue::spawn(&self.inner, false))
    }

    // -- kernels ------------------------------------------------------------

    pub fn load_kernel(
        &self,
        name: impl Into<String>,
        body: Option<KernelFn>,
    ) -> Result<FunctionHandle, QueueError> {
        ensure_control_plane()?;
        let name = name.into();
        debug!(kernel = %name, emulated = body.is_some(), "kernel loaded");
        let key = write(&self.inner.kernels).insert(KernelEntry { name, body });
        Ok(FunctionHandle(key))
    }

    /// Unloads a kernel. Graphs still referring to it fail instantiation.
    pub fn unload_kernel(&self, function: FunctionHandle) -> Result<(), QueueError> {
        ensure_control_plane()?;
        write(&self.inner.kernels)
            .remove(function.0)
            .map(drop)
            .ok_or(QueueError::UnknownHandle {
                resource: ResourceRef::Function(function),
            })
    }

    pub fn kernel_name(&self, function: FunctionHandle) -> Option<String> {
        self.inner.kernel(function).map(|k| k.name)
    }

    // -- events and semaphores ----------------------------------------------

    pub fn create_event(&self) -> Result<EventHandle, QueueError> {
        ensure_control_plane()?;
        let key = write(&self.inner.events).insert(Arc::new(EventState::default()));
        Ok(EventHandle(key))
    }

    pub fn destroy_event(&self, event: EventHandle) -> Result<(), QueueError> {
        ensure_control_plane()?;
        write(&self.inner.events)
            .remove(event.0)
            .ok_or(QueueError::UnknownHandle {
                resource: ResourceRef::Event(event),
            })?;
        self.inner.capture.forget_event(event);
        Ok(())
    }

    /// `true` once every record issued so far has completed.
    pub fn event_query(&self, event: EventHandle) -> Result<bool, QueueError> {
        Ok(self.inner.event(event)?.is_complete())
    }

    pub fn create_semaphore(&self) -> Result<SemaphoreHandle, QueueError> {
        ensure_control_plane()?;
        let key = write(&self.inner.semaphores).insert(Arc::new(SemaphoreState::default()));
        Ok(SemaphoreHandle(key))
    }

    pub fn destroy_semaphore(&self, semaphore: SemaphoreHandle) -> Result<(), QueueError> {
        ensure_control_plane()?;
        write(&self.inner.semaphores)
            .remove(semaphore.0)
            .map(drop)
            .ok_or(QueueError::UnknownHandle {
                resource: ResourceRef::Semaphore(semaphore),
            })
    }

    pub fn semaphore_value(&self, semaphore: SemaphoreHandle) -> Result<u64, QueueError> {
        Ok(self.inner.semaphore(semaphore)?.value())
    }

    /// Signals a semaphore from the host, as an external producer would.
    pub fn signal_semaphore(&self, semaphore: SemaphoreHandle, value: u64) -> Result<(), QueueError> {
        self.inner.semaphore(semaphore)?.signal(value);
        Ok(())
    }

    // -- memory ---------------------------------------------------------------

    pub fn allocate(&self, size: u64) -> Result<DevicePtr, QueueError> {
        ensure_control_plane()?;
        Ok(self.inner.memory().allocate(size)?)
    }

    pub fn free(&self, address: DevicePtr) -> Result<(), QueueError> {
        ensure_control_plane()?;
        Ok(self.inner.memory().free(address)?)
    }

    /// Reads device memory directly. Not ordered with queue work; call
    /// `synchronize` first.
    pub fn read(&self, address: DevicePtr, len: u64) -> Result<Vec<u8>, QueueError> {
        ensure_control_plane()?;
        Ok(self.inner.memory().read(address, len)?)
    }

    pub fn write(&self, address: DevicePtr, bytes: &[u8]) -> Result<(), QueueError> {
        ensure_control_plane()?;
        Ok(self.inner.memory().write(address, bytes)?)
    }

    // -- graphs ---------------------------------------------------------------

    pub fn instantiate(
        &self,
        graph: &Graph,
        options: &InstantiateOptions,
    ) -> Result<Executable, QueueError> {
        ensure_control_plane()?;
        let provider: Arc<dyn ResourceProvider> = Arc::clone(&self.inner) as _;
        Ok(gpgraph_exec::instantiate(graph, provider, options)?)
    }

    pub fn update_executable(&self, exec: &mut Executable, graph: &Graph) -> Result<(), QueueError> {
        ensure_control_plane()?;
        Ok(exec.update(graph)?)
    }

    // -- capture modes ----------------------------------------------------------

    /// Sets the calling thread's capture interaction mode, returning the
    /// previous one.
    pub fn exchange_capture_mode(&self, mode: CaptureMode) -> CaptureMode {
        self.inner.capture.modes().exchange(mode)
    }

    /// Sets the calling thread's mode until the guard is dropped.
    pub fn scoped_capture_mode(&self, mode: CaptureMode) -> ModeGuard<'_> {
        self.inner.capture.modes().scoped(mode)
    }

    pub fn capture_mode(&self) -> CaptureMode {
        self.inner.capture.modes().current()
    }

    // -- synchronization --------------------------------------------------------

    /// Waits for every queue of the device. A potentially unsafe call: fails
    /// (and invalidates the conflicting captures) under the caller's mode.
    pub fn synchronize(&self) -> Result<(), QueueError> {
        ensure_control_plane()?;
        self.inner.capture.check_unsafe("device synchronize")?;
        let mut first = None;
        for queue in self.inner.live_queues() {
            if let Err(err) = queue.wait_idle(&self.inner) {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> DeviceStats {
        let memory = self.inner.memory();
        DeviceStats {
            kernel_launches: self.inner.kernel_launches.load(Ordering::Relaxed),
            replays: self.inner.replays.load(Ordering::Relaxed),
            memory_used: memory.used(),
            memory_capacity: memory.capacity(),
            regions: memory.region_count(),
        }
    }

    pub fn kernel_launches(&self) -> u64 {
        self.inner.kernel_launches.load(Ordering::Relaxed)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Blocking shutdown panics inside another runtime.
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        }
        debug!(context = self.inner.context.0, "device shut down");
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_inside_an_async_context_does_not_block() {
        let outer = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let device = Device::new(DeviceConfig::default()).unwrap();
        let queue = device.create_queue().unwrap();
        queue.synchronize().unwrap();
        drop(queue);
        outer.block_on(async move { drop(device) });
    }
}
