//! Outward-facing façade over the change queue.

use std::sync::Arc;

use crate::queue::ChangeQueue;
use crate::task::Change;

/// What the worker's dispatch side sees of the informer: pull one change at
/// a time, apply it through the executor, acknowledge it.
///
/// `done` must be called for every change `next` hands out, whatever the
/// executor outcome was. Convergence after a failed operation is the next
/// reconciliation tick's job, and an unacknowledged key stays locked out of
/// reconciliation entirely.
#[derive(Clone)]
pub struct ChangeConsumer {
    queue: Arc<ChangeQueue>,
}

impl ChangeConsumer {
    pub(crate) fn new(queue: Arc<ChangeQueue>) -> Self {
        Self { queue }
    }

    /// Next change to apply; `None` once the informer has shut down and the
    /// queue is empty.
    pub async fn next(&self) -> Option<Change> {
        self.queue.get().await
    }

    /// Acknowledge an applied (or failed) change, releasing its task key
    /// for the next reconciliation round.
    pub fn done(&self, change: &Change) {
        self.queue.done(&change.task_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ChangeType;

    fn change(key: &str) -> Change {
        Change {
            task_key: key.to_string(),
            task_type: "demo".to_string(),
            change_type: ChangeType::Create,
            task: None,
        }
    }

    #[tokio::test]
    async fn next_and_done_drive_the_queue() {
        let queue = Arc::new(ChangeQueue::new());
        let consumer = ChangeConsumer::new(Arc::clone(&queue));

        queue.add(change("k1"));
        let got = consumer.next().await.unwrap();
        assert_eq!(got.task_key, "k1");
        assert!(queue.exists("k1"));

        consumer.done(&got);
        assert!(!queue.exists("k1"));
    }

    #[tokio::test]
    async fn next_returns_none_after_shutdown() {
        let queue = Arc::new(ChangeQueue::new());
        let consumer = ChangeConsumer::new(Arc::clone(&queue));
        queue.shut_down();
        assert!(consumer.next().await.is_none());
    }
}
