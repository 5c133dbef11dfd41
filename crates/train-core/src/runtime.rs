//! Async runtime manager
//!
//! The training loop is synchronous; checkpoint and summary I/O run on a
//! small Tokio runtime owned by this manager and are driven from the
//! primary thread with `block_on`, so I/O never overlaps a step.

use crate::{Error, Result};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::info;

/// Runtime manager for checkpoint and summary I/O
pub struct RuntimeManager {
    /// Tokio runtime
    runtime: Option<Runtime>,

    /// Grace period for in-flight tasks at shutdown
    shutdown_timeout: Duration,
}

impl RuntimeManager {
    /// Create a new runtime manager
    pub fn new(io_threads: usize, shutdown_timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(io_threads.max(1))
            .enable_all()
            .thread_name("trainer-io")
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        Ok(Self {
            runtime: Some(runtime),
            shutdown_timeout,
        })
    }

    /// Get the runtime handle for spawning tasks
    pub fn handle(&self) -> Result<tokio::runtime::Handle> {
        self.runtime()
            .map(|runtime| runtime.handle().clone())
    }

    /// Block on a future until completion
    pub fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.as_ref().ok_or_else(|| Error::Internal {
            message: "runtime already shut down".to_string(),
        })
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            // Give tasks time to clean up
            runtime.shutdown_timeout(self.shutdown_timeout);
            info!("Runtime manager shut down");
        }
    }
}

/// Builder for RuntimeManager
pub struct RuntimeManagerBuilder {
    io_threads: usize,
    shutdown_timeout: Duration,
}

impl RuntimeManagerBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self {
            io_threads: 2,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Set I/O thread count
    pub fn io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime manager
    pub fn build(self) -> Result<RuntimeManager> {
        RuntimeManager::new(self.io_threads, self.shutdown_timeout)
    }
}

impl Default for RuntimeManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
