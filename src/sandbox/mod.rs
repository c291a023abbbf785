pub mod namespace;
pub mod process;

pub use namespace::{DirectLauncher, NamespaceLauncher};
pub use process::{WaitOutcome, WorkerOutput, WorkerProcess};

use std::process::Command;
use thiserror::Error;

/// Python program run inside every worker.
pub const WORKER_BOOTSTRAP: &str = include_str!("worker.py");

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to create worker workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// Process-level limits applied to the worker before it execs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessLimits {
    /// Address-space ceiling in MiB; 0 disables it.
    pub memory_limit_mb: u64,
    /// CPU-time backstop in seconds; the wall-clock timeout fires first.
    pub cpu_secs: u64,
    pub max_file_bytes: u64,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024,
            cpu_secs: 31,
            max_file_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Builds the command that starts a worker. Implementations decide which
/// outer isolation wraps the interpreter.
pub trait Launcher: Send + Sync {
    fn name(&self) -> &str;
    fn command(&self, program: &str, args: &[&str]) -> Command;
}
