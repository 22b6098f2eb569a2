//! Executor runtime interface.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::task::Task;

/// The runtime that owns task processes inside this worker. Operations are
/// asynchronous requests: the executor acknowledges acceptance, and the
/// resulting status transition surfaces later through the
/// [`ExecutorLoader`](crate::loader::ExecutorLoader) change stream.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start an executor instance for `task`.
    async fn run(&self, task: &Task) -> Result<()>;

    /// Suspend a running task; it can be resumed later.
    async fn pause(&self, task_key: &str) -> Result<()>;

    /// Resume a paused task.
    async fn resume(&self, task_key: &str) -> Result<()>;

    /// Terminate a task; a stopped task cannot be restarted.
    async fn stop(&self, task_key: &str) -> Result<()>;

    /// Graceful exit: wait for resource reclamation and result
    /// synchronization, bounded by `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}
