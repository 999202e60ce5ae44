//! Process memory sampling for scheduler backpressure.

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Source of the current process memory usage
///
/// Implementations must be cheap to call and hold no state the caller has
/// to lock: the scheduler samples from many tasks at once.
pub trait ResourceSampler: Send + Sync {
    /// Current resident memory of the process, in bytes
    fn used_memory_bytes(&self) -> u64;
}

/// Samples the resident set size of the current process via `sysinfo`
///
/// Each read builds a throwaway [`System`] scoped to this process, so no
/// state is shared between callers.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemorySampler {
    pid: Option<Pid>,
}

impl ProcessMemorySampler {
    /// Create a sampler for the current process
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "Cannot determine current pid, memory backpressure disabled");
                None
            }
        };
        Self { pid }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcessMemorySampler {
    fn used_memory_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Sampler that always reports the same value
///
/// Useful when memory backpressure should never (or always) engage.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub u64);

impl ResourceSampler for FixedSampler {
    fn used_memory_bytes(&self) -> u64 {
        self.0
    }
}
