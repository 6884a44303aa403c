//! Per-thread capture interaction modes.
//!
//! The calling thread's mode decides which active captures a potentially
//! unsafe call (device-wide synchronize, legacy-queue submission) conflicts
//! with:
//!
//! - [`CaptureMode::Global`]: captures this thread began (unless they are
//!   Relaxed) and Global captures begun by any thread;
//! - [`CaptureMode::ThreadLocal`]: only captures this thread began (unless
//!   they are Relaxed);
//! - [`CaptureMode::Relaxed`]: none.
//!
//! Modes live in an explicit registry keyed by thread id. They are changed
//! either by [`ModeRegistry::exchange`] or by a [`ModeGuard`] that restores
//! the previous mode when dropped.

use std::marker::PhantomData;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Global,
    ThreadLocal,
    Relaxed,
}

/// Thread id -> interaction mode. Threads never registered are Global.
#[derive(Debug, Default)]
pub struct ModeRegistry {
    modes: DashMap<ThreadId, CaptureMode>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode of the calling thread.
    pub fn current(&self) -> CaptureMode {
        self.mode_of(thread::current().id())
    }

    pub fn mode_of(&self, thread: ThreadId) -> CaptureMode {
        self.modes.get(&thread).map(|m| *m).unwrap_or_default()
    }

    /// Sets the calling thread's mode and returns the previous one.
    pub fn exchange(&self, mode: CaptureMode) -> CaptureMode {
        let thread = thread::current().id();
        let previous = if mode == CaptureMode::Global {
            self.modes.remove(&thread).map(|(_, m)| m)
        } else {
            self.modes.insert(thread, mode)
        };
        previous.unwrap_or_default()
    }

    /// Sets the calling thread's mode until the guard is dropped.
    pub fn scoped(&self, mode: CaptureMode) -> ModeGuard<'_> {
        let previous = self.exchange(mode);
        ModeGuard {
            registry: self,
            previous,
            _not_send: PhantomData,
        }
    }
}

/// Restores the previous mode of the thread that created it on drop.
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ModeGuard<'a> {
    registry: &'a ModeRegistry,
    previous: CaptureMode,
    // The guard must be dropped on the thread whose mode it changed.
    _not_send: PhantomData<*const ()>,
}

impl ModeGuard<'_> {
    pub fn previous(&self) -> CaptureMode {
        self.previous
    }
}

impl Drop for ModeGuard<'_> {
    fn drop(&mut self) {
        self.registry.exchange(self.previous);
    }
}
