//! Desired-state repository interface.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::task::{Task, TaskStatus};

/// Durable store of want-tasks, owned by the scheduling plane. The informer
/// reads the desired set through it and writes observed status transitions
/// back. Every method is transient-failure territory: callers retry or lean
/// on the next reconciliation tick, never crash.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Fetch the want records for `task_keys`. Keys without a record are
    /// simply absent from the result.
    async fn batch_get_want_tasks(&self, task_keys: &[String]) -> Result<Vec<Task>>;

    /// Record an observed, non-terminal status transition.
    async fn update_task_status(&self, task_key: &str, status: TaskStatus) -> Result<()>;

    /// Record a terminal status plus an operator-facing message.
    async fn finish_task(&self, task_key: &str, status: TaskStatus, message: &str) -> Result<()>;

    /// All task keys currently runnable on `worker_id`.
    async fn list_runnable_tasks(&self, worker_id: &str) -> Result<Vec<String>>;

    /// Subscribe to runnable-set changes for `worker_id`. Each event is a
    /// batch of keys that may have changed; delta or full sets are both
    /// acceptable, the informer only uses them as a trigger. A closed
    /// channel means the watch broke and should be re-established.
    async fn watch_runnable_tasks(
        &self,
        worker_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<String>>>;
}
