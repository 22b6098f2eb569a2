//! Pure diff from want/real task pairs to reconciliation changes.

use tracing::warn;

use crate::task::{change_type, Change, Task, TaskExecResult, TaskStatus};

/// One task seen from both sides. Either side may be absent: a want-only
/// pair is a task this worker has not started, a real-only pair is one the
/// desired set no longer contains.
#[derive(Debug, Clone, Default)]
pub struct TaskPair {
    pub want: Option<Task>,
    pub real: Option<TaskExecResult>,
}

impl TaskPair {
    pub fn task_key(&self) -> &str {
        match (&self.want, &self.real) {
            (Some(want), _) => &want.task_key,
            (None, Some(real)) => &real.task_key,
            (None, None) => "",
        }
    }
}

/// Map each divergent pair to the change that converges it. Pairs whose
/// statuses agree produce nothing; pairs outside the transition table are
/// logged and skipped so a later tick can retry them.
pub fn diff(pairs: Vec<TaskPair>) -> Vec<Change> {
    let mut changes = Vec::new();

    for pair in pairs {
        let want_status = pair
            .want
            .as_ref()
            .map_or(TaskStatus::NotExist, |t| t.status);
        let real_status = pair
            .real
            .as_ref()
            .map_or(TaskStatus::NotExist, |t| t.status);

        if want_status == real_status {
            continue;
        }

        let change = match change_type(real_status, want_status) {
            Ok(Some(change)) => change,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    task_key = %pair.task_key(),
                    real_status = %real_status,
                    want_status = %want_status,
                    "no change type for status pair, skipping: {err}"
                );
                continue;
            }
        };

        let task_key = pair.task_key().to_string();
        let task_type = pair
            .want
            .as_ref()
            .map(|t| t.task_type.clone())
            .unwrap_or_default();
        changes.push(Change {
            task_key,
            task_type,
            change_type: change,
            task: pair.want,
        });
    }

    changes
}
