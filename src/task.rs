//! Core task data model: desired/real task records, status domain, and the
//! divergence → change-type transition table used by the differ.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Task lifecycle status, shared by the desired (recorder) and real
/// (executor) views.
///
/// `NotExist` never appears on the wire; it stands in for "no record on this
/// side" when a pair is diffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotExist,
    WaitRunning,
    Running,
    WaitPaused,
    Paused,
    WaitResume,
    WaitStop,
    Stop,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotExist => "not_exist",
            TaskStatus::WaitRunning => "wait_running",
            TaskStatus::Running => "running",
            TaskStatus::WaitPaused => "wait_paused",
            TaskStatus::Paused => "paused",
            TaskStatus::WaitResume => "wait_resume",
            TaskStatus::WaitStop => "wait_stop",
            TaskStatus::Stop => "stop",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    /// Terminal statuses: the task will never run again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskStatus::Stop | TaskStatus::Success | TaskStatus::Failed
        )
    }

    /// Statuses reached by the executor on its own, without an explicit stop
    /// intent. Pairs containing one of these are excluded from diffing so a
    /// completed task is not restarted by reconciliation.
    pub fn is_auto_finished(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Pending user intent; the differ tolerates these as transient.
    pub fn is_wait(&self) -> bool {
        matches!(
            self,
            TaskStatus::WaitRunning
                | TaskStatus::WaitPaused
                | TaskStatus::WaitResume
                | TaskStatus::WaitStop
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A desired task as recorded by the scheduling plane.
///
/// Everything beyond `task_key`, `task_type` and `status` is opaque to the
/// reconciliation core and carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_key: String,
    pub task_type: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub biz_id: String,
    #[serde(default)]
    pub biz_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Minimal task record, used where only identity and status matter.
    pub fn new(task_key: impl Into<String>, task_type: impl Into<String>, status: TaskStatus) -> Self {
        let now = Utc::now();
        Self {
            task_key: task_key.into(),
            task_type: task_type.into(),
            status,
            biz_id: String::new(),
            biz_type: String::new(),
            payload: Value::Null,
            labels: HashMap::new(),
            message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Observed execution status of one task, from the executor runtime's
/// perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecResult {
    pub task_key: String,
    pub status: TaskStatus,
    /// Executor-reported detail, forwarded to the recorder when the task
    /// reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskExecResult {
    pub fn new(task_key: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_key: task_key.into(),
            status,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Imperative delta the worker applies through the executor API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Pause,
    Resume,
    Stop,
    /// Real side already finished but the desired side still wants activity;
    /// the informer finalizes the record instead of dispatching.
    ExceptionFinish,
    /// Divergence that resolves itself; dropped without dispatch.
    ExceptionIgnore,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Create => "create",
            ChangeType::Pause => "pause",
            ChangeType::Resume => "resume",
            ChangeType::Stop => "stop",
            ChangeType::ExceptionFinish => "exception_finish",
            ChangeType::ExceptionIgnore => "exception_ignore",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of reconciliation work. Dedup identity is `task_key` alone: the
/// queue holds at most one outstanding change per task.
#[derive(Debug, Clone)]
pub struct Change {
    pub task_key: String,
    pub task_type: String,
    pub change_type: ChangeType,
    /// The desired task when one exists. Always present for `Create`.
    pub task: Option<Task>,
}

impl Change {
    pub fn is_exception(&self) -> bool {
        matches!(
            self.change_type,
            ChangeType::ExceptionFinish | ChangeType::ExceptionIgnore
        )
    }
}

/// A real/want status pair outside the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no change type for real status {real} with want status {want}")]
pub struct UnknownTransition {
    pub real: TaskStatus,
    pub want: TaskStatus,
}

/// Map one observed divergence to the change that converges it.
///
/// `Ok(None)` means the divergence is transient (a pending intent the
/// executor has not caught up with yet) and nothing should be dispatched.
/// `Err` marks a pair the table does not cover; callers log it and leave the
/// divergence for a later tick.
pub fn change_type(real: TaskStatus, want: TaskStatus) -> Result<Option<ChangeType>, UnknownTransition> {
    use ChangeType::*;
    use TaskStatus::*;

    let change = match (real, want) {
        (NotExist, WaitRunning) => Some(Create),
        (NotExist, WaitStop) => Some(ChangeType::Stop),
        (NotExist, WaitPaused | WaitResume | NotExist) => None,

        (Running, WaitPaused) => Some(Pause),
        (Running, WaitStop) => Some(ChangeType::Stop),
        (Running, NotExist) => Some(ExceptionFinish),
        (Running, WaitRunning | WaitResume) => None,

        (Paused, WaitResume) => Some(Resume),
        (Paused, WaitStop) => Some(ChangeType::Stop),
        (Paused, NotExist) => Some(ExceptionFinish),
        (Paused, WaitRunning | WaitPaused) => None,

        (TaskStatus::Stop | Success | Failed, WaitRunning | WaitPaused | WaitResume) => Some(ExceptionIgnore),
        (TaskStatus::Stop | Success | Failed, WaitStop | NotExist) => None,

        (real, want) => return Err(UnknownTransition { real, want }),
    };
    Ok(change)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(TaskStatus::Stop.is_final());
        assert!(TaskStatus::Success.is_final());
        assert!(TaskStatus::Failed.is_final());
        assert!(!TaskStatus::Running.is_final());

        assert!(TaskStatus::Success.is_auto_finished());
        assert!(TaskStatus::Failed.is_auto_finished());
        assert!(!TaskStatus::Stop.is_auto_finished());

        assert!(TaskStatus::WaitRunning.is_wait());
        assert!(TaskStatus::WaitStop.is_wait());
        assert!(!TaskStatus::Paused.is_wait());
    }

    #[test]
    fn status_wire_values_round_trip() {
        for status in [
            TaskStatus::WaitRunning,
            TaskStatus::Running,
            TaskStatus::WaitPaused,
            TaskStatus::Paused,
            TaskStatus::WaitResume,
            TaskStatus::WaitStop,
            TaskStatus::Stop,
            TaskStatus::Success,
            TaskStatus::Failed,
        ] {
            let wire = serde_json::to_string(&status).unwrap();
            assert_eq!(wire, format!("\"{}\"", status.as_str()));
            let back: TaskStatus = serde_json::from_str(&wire).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn transition_table_dispatchable_changes() {
        use TaskStatus::*;
        assert_eq!(change_type(NotExist, WaitRunning), Ok(Some(ChangeType::Create)));
        assert_eq!(change_type(NotExist, WaitStop), Ok(Some(ChangeType::Stop)));
        assert_eq!(change_type(Running, WaitPaused), Ok(Some(ChangeType::Pause)));
        assert_eq!(change_type(Running, WaitStop), Ok(Some(ChangeType::Stop)));
        assert_eq!(change_type(Paused, WaitResume), Ok(Some(ChangeType::Resume)));
        assert_eq!(change_type(Paused, WaitStop), Ok(Some(ChangeType::Stop)));
    }

    #[test]
    fn transition_table_exceptions() {
        use TaskStatus::*;
        assert_eq!(change_type(Running, NotExist), Ok(Some(ChangeType::ExceptionFinish)));
        assert_eq!(change_type(Paused, NotExist), Ok(Some(ChangeType::ExceptionFinish)));
        for real in [Stop, Success, Failed] {
            for want in [WaitRunning, WaitPaused, WaitResume] {
                assert_eq!(change_type(real, want), Ok(Some(ChangeType::ExceptionIgnore)));
            }
            assert_eq!(change_type(real, WaitStop), Ok(None));
            assert_eq!(change_type(real, NotExist), Ok(None));
        }
    }

    #[test]
    fn transition_table_transient_pairs() {
        use TaskStatus::*;
        assert_eq!(change_type(Running, WaitRunning), Ok(None));
        assert_eq!(change_type(Running, WaitResume), Ok(None));
        assert_eq!(change_type(Paused, WaitPaused), Ok(None));
        assert_eq!(change_type(Paused, WaitRunning), Ok(None));
        assert_eq!(change_type(NotExist, WaitPaused), Ok(None));
    }

    #[test]
    fn transition_table_rejects_uncovered_pairs() {
        use TaskStatus::*;
        let err = change_type(WaitRunning, WaitStop).unwrap_err();
        assert_eq!(err.real, WaitRunning);
        assert_eq!(err.want, WaitStop);
        // Uncovered want-side values surface as errors too.
        assert!(change_type(NotExist, Running).is_err());
        assert!(change_type(Paused, Success).is_err());
    }
}
