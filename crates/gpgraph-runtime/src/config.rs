//! Device configuration.
//!
//! Read from environment variables over defaults:
//! - `GPGRAPH_MEMORY_CAPACITY`: simulated device memory in bytes (default 256 MiB)
//! - `GPGRAPH_WORKERS`: queue worker threads (default 2)

use serde::{Deserialize, Serialize};

pub const MEMORY_CAPACITY_VAR: &str = "GPGRAPH_MEMORY_CAPACITY";
pub const WORKERS_VAR: &str = "GPGRAPH_WORKERS";

/// Configuration for a [`Device`](crate::Device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Ordinal reported for device memory.
    pub ordinal: u32,

    /// Bytes of simulated device memory.
    pub memory_capacity: u64,

    /// Worker threads of the device runtime. Queues are tasks, not threads,
    /// so any number of queues share these.
    pub worker_threads: usize,

    /// Host callbacks allowed to run at once.
    pub max_host_callbacks: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            ordinal: 0,
            memory_capacity: 256 << 20,
            worker_threads: 2,
            max_host_callbacks: 8,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name. Unparsable values are
    /// ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(capacity) = lookup(MEMORY_CAPACITY_VAR).and_then(|v| v.trim().parse().ok()) {
            self.memory_capacity = capacity;
        }
        if let Some(workers) = lookup(WORKERS_VAR)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|w| *w > 0)
        {
            self.worker_threads = workers;
        }
        self
    }
}
