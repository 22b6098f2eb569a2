//! In-memory collaborators: a recorder backed by a task map and a simulated
//! executor runtime.
//!
//! These mirror the production model without a database or a process pool,
//! which is what the integration tests (and local experiments) run against.
//! The executor is symbolic: statuses move, no payload executes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::executor::Executor;
use crate::loader::ExecutorLoader;
use crate::recorder::Recorder;
use crate::task::{Task, TaskExecResult, TaskStatus};

struct StoredTask {
    task: Task,
    worker_id: String,
}

/// Recorder holding want-tasks in a mutex-guarded map, with watch fan-out
/// and a write log for assertions.
#[derive(Default)]
pub struct InMemoryRecorder {
    tasks: Mutex<HashMap<String, StoredTask>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Vec<String>>>>,
    updates: Mutex<Vec<(String, TaskStatus)>>,
    finishes: Mutex<Vec<(String, TaskStatus, String)>>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a want-task assigned to `worker_id` and notify
    /// watchers.
    pub fn put_task(&self, worker_id: &str, task: Task) {
        let key = task.task_key.clone();
        self.tasks.lock().unwrap().insert(
            key.clone(),
            StoredTask {
                task,
                worker_id: worker_id.to_string(),
            },
        );
        self.notify(vec![key]);
    }

    /// Flip the want status of an existing task and notify watchers.
    pub fn set_want_status(&self, task_key: &str, status: TaskStatus) {
        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(stored) = tasks.get_mut(task_key) {
                stored.task.status = status;
                stored.task.updated_at = Utc::now();
            }
        }
        self.notify(vec![task_key.to_string()]);
    }

    /// Remove a task from the desired set entirely and notify watchers.
    pub fn remove_task(&self, task_key: &str) {
        self.tasks.lock().unwrap().remove(task_key);
        self.notify(vec![task_key.to_string()]);
    }

    /// Current record for `task_key`, if any.
    pub fn task(&self, task_key: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_key)
            .map(|stored| stored.task.clone())
    }

    /// Every `update_task_status` call observed so far.
    pub fn update_calls(&self) -> Vec<(String, TaskStatus)> {
        self.updates.lock().unwrap().clone()
    }

    /// Every `finish_task` call observed so far.
    pub fn finish_calls(&self) -> Vec<(String, TaskStatus, String)> {
        self.finishes.lock().unwrap().clone()
    }

    fn notify(&self, keys: Vec<String>) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(keys.clone()).is_ok());
    }
}

#[async_trait]
impl Recorder for InMemoryRecorder {
    async fn batch_get_want_tasks(&self, task_keys: &[String]) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(task_keys
            .iter()
            .filter_map(|key| tasks.get(key).map(|stored| stored.task.clone()))
            .collect())
    }

    async fn update_task_status(&self, task_key: &str, status: TaskStatus) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((task_key.to_string(), status));
        let mut tasks = self.tasks.lock().unwrap();
        // A record deleted underneath an update is a zero-row write, not an
        // error; the next tick sees the absence.
        if let Some(stored) = tasks.get_mut(task_key) {
            stored.task.status = status;
            stored.task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_task(&self, task_key: &str, status: TaskStatus, message: &str) -> Result<()> {
        self.finishes
            .lock()
            .unwrap()
            .push((task_key.to_string(), status, message.to_string()));
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(stored) = tasks.get_mut(task_key) {
            stored.task.status = status;
            stored.task.message = Some(message.to_string());
            stored.task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_runnable_tasks(&self, worker_id: &str) -> Result<Vec<String>> {
        let tasks = self.tasks.lock().unwrap();
        Ok(tasks
            .values()
            .filter(|stored| stored.worker_id == worker_id && !stored.task.status.is_final())
            .map(|stored| stored.task.task_key.clone())
            .collect())
    }

    async fn watch_runnable_tasks(
        &self,
        _worker_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<String>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Simulated executor runtime: a per-key status map that moves on command
/// and pushes a `TaskExecResult` for every transition. `complete` lets
/// tests finish a task "on its own", the way a real payload would.
#[derive(Default)]
pub struct InMemoryExecutor {
    states: Mutex<HashMap<String, TaskExecResult>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TaskExecResult>>>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a task reaching a terminal status by itself.
    pub fn complete(&self, task_key: &str, status: TaskStatus, message: &str) {
        let result = TaskExecResult::new(task_key, status).with_message(message);
        self.transition(result);
    }

    /// Observed status for `task_key`, if the executor knows it.
    pub fn status(&self, task_key: &str) -> Option<TaskStatus> {
        self.states
            .lock()
            .unwrap()
            .get(task_key)
            .map(|result| result.status)
    }

    fn transition(&self, result: TaskExecResult) {
        debug!(task_key = %result.task_key, status = %result.status, "executor transition");
        self.states
            .lock()
            .unwrap()
            .insert(result.task_key.clone(), result.clone());
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(result.clone()).is_ok());
    }
}

#[async_trait]
impl Executor for InMemoryExecutor {
    async fn run(&self, task: &Task) -> Result<()> {
        if self.status(&task.task_key) == Some(TaskStatus::Running) {
            return Ok(());
        }
        self.transition(TaskExecResult::new(&task.task_key, TaskStatus::Running));
        Ok(())
    }

    async fn pause(&self, task_key: &str) -> Result<()> {
        if self.status(task_key).is_none() {
            bail!("pause {task_key}: unknown task");
        }
        self.transition(TaskExecResult::new(task_key, TaskStatus::Paused));
        Ok(())
    }

    async fn resume(&self, task_key: &str) -> Result<()> {
        if self.status(task_key).is_none() {
            bail!("resume {task_key}: unknown task");
        }
        self.transition(TaskExecResult::new(task_key, TaskStatus::Running));
        Ok(())
    }

    async fn stop(&self, task_key: &str) -> Result<()> {
        // Stopping a task the executor never ran still records the stop, so
        // the desired stop intent converges.
        self.transition(TaskExecResult::new(task_key, TaskStatus::Stop));
        Ok(())
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ExecutorLoader for InMemoryExecutor {
    async fn list(&self) -> Result<Vec<TaskExecResult>> {
        Ok(self.states.lock().unwrap().values().cloned().collect())
    }

    fn change_results(&self) -> mpsc::UnboundedReceiver<TaskExecResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
