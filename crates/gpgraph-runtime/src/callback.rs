//! Host callback execution.
//!
//! Callbacks run on the runtime's blocking pool, never on a queue worker,
//! with at most `max_host_callbacks` running at once. While one runs, its
//! thread is marked so control-plane calls made from it fail with
//! [`QueueError::HostCallbackReentry`].

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::error;

use gpgraph_core::{HostCallbackContext, HostFn};

use crate::error::{DeviceFault, QueueError};

thread_local! {
    static IN_HOST_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Fails when called from inside a host callback.
pub(crate) fn ensure_control_plane() -> Result<(), QueueError> {
    if IN_HOST_CALLBACK.with(Cell::get) {
        return Err(QueueError::HostCallbackReentry);
    }
    Ok(())
}

struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        IN_HOST_CALLBACK.with(|flag| flag.set(true));
        CallbackScope
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_HOST_CALLBACK.with(|flag| flag.set(false));
    }
}

/// Runs `callback` on the blocking pool and waits for it.
pub(crate) async fn run_host_callback(
    slots: &Arc<Semaphore>,
    callback: HostFn,
    context: HostCallbackContext,
) -> Result<(), DeviceFault> {
    let panicked = DeviceFault::HostCallbackPanicked { node: context.node };
    let Ok(_permit) = Arc::clone(slots).acquire_owned().await else {
        return Err(panicked);
    };
    let outcome = tokio::task::spawn_blocking(move || {
        let _scope = CallbackScope::enter();
        panic::catch_unwind(AssertUnwindSafe(|| callback(&context)))
    })
    .await;

    match outcome {
        Ok(Ok(())) => Ok(()),
        _ => {
            error!(node = ?context.node, launch = context.launch, "host callback panicked");
            Err(panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn control_plane_allowed_outside_callbacks() {
        assert!(ensure_control_plane().is_ok());
    }

    #[tokio::test]
    async fn callback_thread_is_marked() {
        let slots = Arc::new(Semaphore::new(1));
        let seen = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&seen);
        let callback: HostFn = Arc::new(move |_: &HostCallbackContext| {
            if matches!(ensure_control_plane(), Err(QueueError::HostCallbackReentry)) {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });
        let context = HostCallbackContext {
            node: None,
            launch: 0,
        };
        run_host_callback(&slots, callback, context).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_becomes_fault() {
        let slots = Arc::new(Semaphore::new(1));
        let callback: HostFn = Arc::new(|_: &HostCallbackContext| panic!("boom"));
        let context = HostCallbackContext {
            node: None,
            launch: 3,
        };
        let fault = run_host_callback(&slots, callback, context).await.unwrap_err();
        assert_eq!(fault, DeviceFault::HostCallbackPanicked { node: None });
    }
}
