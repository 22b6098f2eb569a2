//! Real-status source interface.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::task::TaskExecResult;

/// Window into the executor runtime that actually runs tasks inside this
/// worker. The indexer seeds its cache from `list` and follows
/// `change_results` afterwards; `list` also backs the periodic resync.
#[async_trait]
pub trait ExecutorLoader: Send + Sync {
    /// Snapshot of every task the executor currently knows about.
    async fn list(&self) -> Result<Vec<TaskExecResult>>;

    /// Push stream of status changes. Each call returns a fresh
    /// subscription; events sent before subscribing are not replayed.
    fn change_results(&self) -> mpsc::UnboundedReceiver<TaskExecResult>;
}
