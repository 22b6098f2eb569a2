//! The reconciliation orchestrator.
//!
//! `run` drives two loops until shutdown: the enqueue loop consumes trigger
//! impulses, loads want/real pairs, diffs them and feeds the change queue;
//! the monitor loop follows the indexer and writes observed status
//! transitions back to the recorder, releasing each task's queue slot when
//! the write settles. The queue's per-key dedup plus the in-progress key
//! exclusion in the enqueue loop are the only cross-loop synchronization:
//! a task with an outstanding change is never re-diffed until `done`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::InformerConfig;
use crate::consumer::ChangeConsumer;
use crate::differ::{diff, TaskPair};
use crate::indexer::{Indexer, StatusSink};
use crate::queue::ChangeQueue;
use crate::recorder::Recorder;
use crate::retry::{retry, RetryPolicy};
use crate::task::{ChangeType, TaskExecResult, TaskStatus};
use crate::trigger::{Trigger, TriggerInfo};

#[derive(Debug, Error)]
pub enum InformerError {
    #[error("informer is already running")]
    AlreadyRunning,
    #[error("informer startup failed: {0}")]
    Startup(#[from] anyhow::Error),
    #[error("shutdown drain did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

pub struct Informer {
    running: AtomicBool,
    indexer: Arc<Indexer>,
    recorder: Arc<dyn Recorder>,
    change_queue: Arc<ChangeQueue>,
    config: InformerConfig,
}

impl Informer {
    pub fn new(indexer: Arc<Indexer>, recorder: Arc<dyn Recorder>, config: InformerConfig) -> Self {
        Self {
            running: AtomicBool::new(false),
            indexer,
            recorder,
            change_queue: Arc::new(ChangeQueue::new()),
            config,
        }
    }

    /// Handle for the dispatch side: pull changes, apply them through the
    /// executor, acknowledge.
    pub fn change_consumer(&self) -> ChangeConsumer {
        ChangeConsumer::new(Arc::clone(&self.change_queue))
    }

    /// Reconcile until `shutdown` flips. At most one `run` may be active
    /// per informer.
    pub async fn run(
        &self,
        worker_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), InformerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(InformerError::AlreadyRunning);
        }
        let result = self.run_inner(worker_id, shutdown).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        worker_id: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), InformerError> {
        let trigger = Trigger::start(
            Arc::clone(&self.recorder),
            worker_id,
            &self.config,
            shutdown.clone(),
        )
        .await?;

        info!(
            worker_id = %worker_id,
            resync_interval_ms = self.config.resync_interval.as_millis(),
            "informer running",
        );

        let sink = WriteBackSink {
            recorder: Arc::clone(&self.recorder),
            queue: Arc::clone(&self.change_queue),
            policy: self.config.write_retry,
        };

        tokio::join!(
            self.enqueue_loop(trigger, shutdown.clone()),
            self.indexer.monitor(shutdown, &sink),
        );

        info!(worker_id = %worker_id, "informer stopped");
        Ok(())
    }

    /// Release the change queue gracefully: refuse new changes immediately,
    /// wait up to `timeout` for pending and in-flight ones to drain. The
    /// monitor loops keep running; they stop with the `shutdown` channel
    /// handed to `run`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), InformerError> {
        match tokio::time::timeout(timeout, self.change_queue.shut_down_with_drain()).await {
            Ok(()) => {
                info!("informer shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!(timeout_ms = timeout.as_millis(), "informer shutdown timed out");
                Err(InformerError::ShutdownTimeout(timeout))
            }
        }
    }

    async fn enqueue_loop(&self, mut trigger: Trigger, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = trigger.recv() => match maybe {
                    Some(info) => self.reconcile_tick(info).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn reconcile_tick(&self, info: TriggerInfo) {
        let pairs = match self.load_task_pairs(&info).await {
            Ok(pairs) => pairs,
            Err(err) => {
                // Never enqueue partial diffs; the next tick retries.
                metrics::counter!("taskfleet_reconcile_tick_failures_total").increment(1);
                warn!(error = ?err, "loading task pairs failed; skipping trigger tick");
                return;
            }
        };

        let changes = self.handle_exceptions(diff(pairs)).await;
        for change in changes {
            let task_key = change.task_key.clone();
            let change_type = change.change_type;
            if !self.change_queue.add(change) {
                metrics::counter!("taskfleet_changes_enqueued_total").increment(1);
                info!(task_key = %task_key, change_type = %change_type, "enqueued change");
            }
        }
    }

    /// Load the want and real sides for one tick, excluding any key with an
    /// outstanding change so per-task application stays serial.
    async fn load_task_pairs(&self, info: &TriggerInfo) -> anyhow::Result<Vec<TaskPair>> {
        let want_keys: Vec<String> = info
            .task_keys
            .iter()
            .filter(|key| !self.change_queue.exists(key))
            .cloned()
            .collect();
        let real_keys: Vec<String> = if info.resync {
            self.indexer
                .list_task_keys()
                .into_iter()
                .filter(|key| !self.change_queue.exists(key))
                .collect()
        } else {
            want_keys.clone()
        };

        let want_tasks = if want_keys.is_empty() {
            Vec::new()
        } else {
            self.recorder.batch_get_want_tasks(&want_keys).await?
        };
        let real_tasks = if real_keys.is_empty() {
            Vec::new()
        } else {
            self.indexer.list_tasks(&real_keys)
        };

        let mut real_by_key: HashMap<String, TaskExecResult> = real_tasks
            .into_iter()
            .map(|result| (result.task_key.clone(), result))
            .collect();

        let mut pairs = Vec::with_capacity(want_tasks.len() + real_by_key.len());
        for want in want_tasks {
            let real = real_by_key.remove(&want.task_key);
            pairs.push(TaskPair {
                want: Some(want),
                real,
            });
        }
        for (_, real) in real_by_key {
            pairs.push(TaskPair {
                want: None,
                real: Some(real),
            });
        }

        // A finished task must not be restarted by reconciliation: drop any
        // pair with an auto-finished side before diffing.
        pairs.retain(|pair| {
            let want_finished = pair
                .want
                .as_ref()
                .is_some_and(|t| t.status.is_auto_finished());
            let real_finished = pair
                .real
                .as_ref()
                .is_some_and(|t| t.status.is_auto_finished());
            !want_finished && !real_finished
        });

        Ok(pairs)
    }

    /// Split off exception changes: `ExceptionFinish` finalizes the record
    /// directly (best effort), `ExceptionIgnore` is dropped. The rest go to
    /// the queue.
    async fn handle_exceptions(
        &self,
        changes: Vec<crate::task::Change>,
    ) -> Vec<crate::task::Change> {
        let mut normal = Vec::with_capacity(changes.len());
        for change in changes {
            if !change.is_exception() {
                normal.push(change);
                continue;
            }
            if change.change_type == ChangeType::ExceptionFinish {
                warn!(
                    task_key = %change.task_key,
                    "real task has no live desired counterpart; finalizing record"
                );
                if let Err(err) = self
                    .recorder
                    .finish_task(&change.task_key, TaskStatus::Stop, "exception finish")
                    .await
                {
                    warn!(task_key = %change.task_key, error = ?err, "exception finish write failed");
                }
            }
        }
        normal
    }
}

/// Write-back half of the monitor loop: recorder write under bounded retry,
/// then release the task's queue slot no matter what. A write that keeps
/// failing is logged and surfaces again on the next reconciliation tick;
/// holding the slot forever would lock the task out instead.
struct WriteBackSink {
    recorder: Arc<dyn Recorder>,
    queue: Arc<ChangeQueue>,
    policy: RetryPolicy,
}

#[async_trait::async_trait]
impl StatusSink for WriteBackSink {
    async fn on_status_change(&self, result: &TaskExecResult) {
        info!(task_key = %result.task_key, status = %result.status, "observed task status change");

        let write = retry(self.policy, || async move {
            if result.status.is_final() {
                let message = result.message.as_deref().unwrap_or("");
                self.recorder
                    .finish_task(&result.task_key, result.status, message)
                    .await
            } else {
                self.recorder
                    .update_task_status(&result.task_key, result.status)
                    .await
            }
        })
        .await;

        if let Err(err) = write {
            metrics::counter!("taskfleet_recorder_write_failures_total").increment(1);
            error!(task_key = %result.task_key, error = ?err, "recorder write failed after retries");
        }

        self.queue.done(&result.task_key);
    }
}
