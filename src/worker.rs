//! Worker assembly: one informer plus the dispatch loop that applies its
//! changes through an executor.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::consumer::ChangeConsumer;
use crate::executor::Executor;
use crate::indexer::Indexer;
use crate::informer::Informer;
use crate::loader::ExecutorLoader;
use crate::recorder::Recorder;
use crate::task::ChangeType;

/// A running worker: reconciliation loops plus the executor dispatch loop.
/// Dropping the handle does not stop the worker; call [`Worker::shutdown`].
pub struct Worker {
    shutdown_tx: watch::Sender<bool>,
    informer: Arc<Informer>,
    executor: Arc<dyn Executor>,
    informer_handle: JoinHandle<()>,
    dispatch_handle: JoinHandle<()>,
    config: WorkerConfig,
}

impl Worker {
    /// Build the indexer (fatal if the initial executor snapshot fails),
    /// start the informer and the dispatch loop.
    pub async fn start(
        recorder: Arc<dyn Recorder>,
        loader: Arc<dyn ExecutorLoader>,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
    ) -> Result<Self> {
        let indexer = Arc::new(Indexer::new(loader, config.informer.clone()).await?);
        let informer = Arc::new(Informer::new(
            indexer,
            Arc::clone(&recorder),
            config.informer.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let informer_handle = {
            let informer = Arc::clone(&informer);
            let worker_id = config.worker_id.clone();
            tokio::spawn(async move {
                if let Err(err) = informer.run(&worker_id, shutdown_rx).await {
                    error!(worker_id = %worker_id, error = %err, "informer terminated with error");
                }
            })
        };

        let dispatch_handle = {
            let consumer = informer.change_consumer();
            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                dispatch_loop(consumer, executor).await;
            })
        };

        info!(worker_id = %config.worker_id, "worker started");

        Ok(Self {
            shutdown_tx,
            informer,
            executor,
            informer_handle,
            dispatch_handle,
            config,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Staged graceful exit: drain outstanding changes, stop the
    /// reconciliation loops, shut the executor down, join everything.
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        let drain = self.informer.shutdown(timeout).await;

        let _ = self.shutdown_tx.send(true);
        let executor_result = self.executor.shutdown(timeout).await;

        self.informer_handle
            .await
            .map_err(|err| anyhow!("informer task panicked: {err}"))?;
        self.dispatch_handle
            .await
            .map_err(|err| anyhow!("dispatch task panicked: {err}"))?;

        drain?;
        executor_result?;
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }
}

/// Apply changes one at a time. Operation failures are logged only: the
/// change is acknowledged either way, and the next reconciliation tick
/// re-observes whatever divergence remains.
async fn dispatch_loop(consumer: ChangeConsumer, executor: Arc<dyn Executor>) {
    while let Some(change) = consumer.next().await {
        let outcome = match change.change_type {
            ChangeType::Create => match &change.task {
                Some(task) => executor.run(task).await,
                None => Err(anyhow!("create change without a task record")),
            },
            ChangeType::Pause => executor.pause(&change.task_key).await,
            ChangeType::Resume => executor.resume(&change.task_key).await,
            ChangeType::Stop => executor.stop(&change.task_key).await,
            // Exception changes are resolved by the informer and never reach
            // the queue.
            ChangeType::ExceptionFinish | ChangeType::ExceptionIgnore => Ok(()),
        };

        if let Err(err) = outcome {
            metrics::counter!("taskfleet_dispatch_errors_total").increment(1);
            warn!(
                task_key = %change.task_key,
                change_type = %change.change_type,
                error = ?err,
                "executor operation failed",
            );
        }

        consumer.done(&change);
    }
}
