//! Cache of real execution status per task key.
//!
//! The indexer seeds itself from one executor snapshot at construction,
//! then follows two inputs inside `monitor`: the loader's push stream and a
//! periodic resync snapshot that catches anything the stream missed. Every
//! accepted event lands in the cache and is handed to a [`StatusSink`]
//! outside the lock. Terminal entries are swept out one recycle period
//! after they were last written, which is what finally forgets a task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::InformerConfig;
use crate::loader::ExecutorLoader;
use crate::task::TaskExecResult;

/// Receiver for post-change notifications; the informer's write-back path
/// implements this. Invoked after the cache reflects the change.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn on_status_change(&self, result: &TaskExecResult);
}

struct CacheEntry {
    result: TaskExecResult,
    set_at: Instant,
}

pub struct Indexer {
    loader: Arc<dyn ExecutorLoader>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    config: InformerConfig,
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer").finish_non_exhaustive()
    }
}

impl Indexer {
    /// Build the indexer around an initial executor snapshot. A worker
    /// without its initial real view cannot reconcile safely, so a failed
    /// snapshot fails construction.
    pub async fn new(loader: Arc<dyn ExecutorLoader>, config: InformerConfig) -> Result<Self> {
        let initial = loader
            .list()
            .await
            .context("initial executor snapshot failed")?;

        let now = Instant::now();
        let cache = initial
            .into_iter()
            .map(|result| {
                (
                    result.task_key.clone(),
                    CacheEntry {
                        result,
                        set_at: now,
                    },
                )
            })
            .collect();

        Ok(Self {
            loader,
            cache: Mutex::new(cache),
            config,
        })
    }

    /// Cached results for `keys`; an empty slice selects everything.
    pub fn list_tasks(&self, keys: &[String]) -> Vec<TaskExecResult> {
        let cache = self.lock_cache();
        if keys.is_empty() {
            return cache.values().map(|entry| entry.result.clone()).collect();
        }
        keys.iter()
            .filter_map(|key| cache.get(key).map(|entry| entry.result.clone()))
            .collect()
    }

    /// Every task key currently cached.
    pub fn list_task_keys(&self) -> Vec<String> {
        self.lock_cache().keys().cloned().collect()
    }

    /// Follow the executor until shutdown: push events from the change
    /// stream, resync snapshots on the ticker, recycling on each sweep.
    /// Events are applied in arrival order; the sink runs outside the cache
    /// lock.
    pub async fn monitor(&self, mut shutdown: watch::Receiver<bool>, sink: &dyn StatusSink) {
        let mut changes = Some(self.loader.change_results());
        let mut ticker = interval(self.config.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The cache was seeded at construction; skip the immediate tick.
        ticker.tick().await;

        loop {
            let next_change = async {
                match changes.as_mut() {
                    Some(rx) => rx.recv().await,
                    // Stream is gone; park this arm and let resync carry on.
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh(sink).await;
                    self.sweep_recyclable();
                }
                maybe = next_change => {
                    match maybe {
                        Some(result) => self.apply(result, sink).await,
                        None => {
                            warn!("executor change stream closed; resync continues");
                            changes = None;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self, sink: &dyn StatusSink) {
        let snapshot = match self.loader.list().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = ?err, "executor snapshot failed during resync");
                return;
            }
        };

        let changed: Vec<TaskExecResult> = {
            let cache = self.lock_cache();
            snapshot
                .into_iter()
                .filter(|new| {
                    cache
                        .get(&new.task_key)
                        .map_or(true, |entry| entry.result.status != new.status)
                })
                .collect()
        };

        for result in changed {
            self.apply(result, sink).await;
        }
    }

    async fn apply(&self, result: TaskExecResult, sink: &dyn StatusSink) {
        {
            let mut cache = self.lock_cache();
            cache.insert(
                result.task_key.clone(),
                CacheEntry {
                    result: result.clone(),
                    set_at: Instant::now(),
                },
            );
        }
        sink.on_status_change(&result).await;
    }

    fn sweep_recyclable(&self) {
        let recycle_after = self.config.recycle_after;
        let mut cache = self.lock_cache();
        cache.retain(|key, entry| {
            let recyclable =
                entry.result.status.is_final() && entry.set_at.elapsed() > recycle_after;
            if recyclable {
                debug!(task_key = %key, status = %entry.result.status, "recycling cache entry");
            }
            !recyclable
        });
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().expect("indexer cache lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::task::TaskStatus;

    struct ScriptedLoader {
        snapshots: Mutex<Vec<Vec<TaskExecResult>>>,
        subscribers: Mutex<Vec<mpsc::UnboundedSender<TaskExecResult>>>,
    }

    impl ScriptedLoader {
        fn new(initial: Vec<TaskExecResult>) -> Self {
            Self {
                snapshots: Mutex::new(vec![initial]),
                subscribers: Mutex::new(Vec::new()),
            }
        }

        fn push_snapshot(&self, snapshot: Vec<TaskExecResult>) {
            self.snapshots.lock().unwrap().push(snapshot);
        }

        fn emit(&self, result: TaskExecResult) {
            for tx in self.subscribers.lock().unwrap().iter() {
                let _ = tx.send(result.clone());
            }
        }
    }

    #[async_trait]
    impl ExecutorLoader for ScriptedLoader {
        async fn list(&self) -> Result<Vec<TaskExecResult>> {
            let snapshots = self.snapshots.lock().unwrap();
            Ok(snapshots.last().cloned().unwrap_or_default())
        }

        fn change_results(&self) -> mpsc::UnboundedReceiver<TaskExecResult> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers.lock().unwrap().push(tx);
            rx
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<TaskExecResult>>,
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        async fn on_status_change(&self, result: &TaskExecResult) {
            self.seen.lock().unwrap().push(result.clone());
        }
    }

    fn result(key: &str, status: TaskStatus) -> TaskExecResult {
        TaskExecResult::new(key, status)
    }

    fn config(resync_ms: u64, recycle_ms: u64) -> InformerConfig {
        InformerConfig::default()
            .with_resync_interval(Duration::from_millis(resync_ms))
            .with_recycle_after(Duration::from_millis(recycle_ms))
    }

    #[tokio::test]
    async fn initial_snapshot_seeds_cache() {
        let loader = Arc::new(ScriptedLoader::new(vec![
            result("k1", TaskStatus::Running),
            result("k2", TaskStatus::Paused),
        ]));
        let indexer = Indexer::new(loader, config(1000, 1000)).await.unwrap();

        let mut keys = indexer.list_task_keys();
        keys.sort();
        assert_eq!(keys, vec!["k1".to_string(), "k2".to_string()]);

        let filtered = indexer.list_tasks(&["k2".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].status, TaskStatus::Paused);

        let all = indexer.list_tasks(&[]);
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn pushed_change_updates_cache_and_invokes_sink() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let indexer = Arc::new(Indexer::new(loader.clone(), config(10_000, 10_000)).await.unwrap());
        let sink = Arc::new(RecordingSink::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = {
            let indexer = Arc::clone(&indexer);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { indexer.monitor(shutdown_rx, sink.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        loader.emit(result("k1", TaskStatus::Running));

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !indexer.list_tasks(&["k1".to_string()]).is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "change never reached the cache");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(sink.seen.lock().unwrap().len(), 1);
        let _ = shutdown_tx.send(true);
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn resync_detects_drift_missed_by_the_stream() {
        let loader = Arc::new(ScriptedLoader::new(vec![result("k1", TaskStatus::Running)]));
        let indexer = Arc::new(Indexer::new(loader.clone(), config(30, 10_000)).await.unwrap());
        let sink = Arc::new(RecordingSink::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = {
            let indexer = Arc::clone(&indexer);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { indexer.monitor(shutdown_rx, sink.as_ref()).await })
        };

        // Status drifts without a stream event; only the snapshot shows it.
        loader.push_snapshot(vec![result("k1", TaskStatus::Paused)]);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let tasks = indexer.list_tasks(&["k1".to_string()]);
            if tasks.first().map(|t| t.status) == Some(TaskStatus::Paused) {
                break;
            }
            assert!(Instant::now() < deadline, "resync never applied the drift");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = sink.seen.lock().unwrap();
        assert!(seen.iter().any(|r| r.status == TaskStatus::Paused));
        drop(seen);
        let _ = shutdown_tx.send(true);
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn final_entries_are_recycled_after_the_grace_period() {
        let loader = Arc::new(ScriptedLoader::new(vec![result("k1", TaskStatus::Success)]));
        let indexer = Arc::new(Indexer::new(loader.clone(), config(20, 50)).await.unwrap());
        assert_eq!(indexer.list_task_keys(), vec!["k1".to_string()]);
        // Later snapshots are empty, so resync does not re-introduce the
        // finished task after eviction.
        loader.push_snapshot(vec![]);
        let sink = Arc::new(RecordingSink::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = {
            let indexer = Arc::clone(&indexer);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { indexer.monitor(shutdown_rx, sink.as_ref()).await })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if indexer.list_task_keys().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "final entry never recycled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = shutdown_tx.send(true);
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn closed_stream_leaves_resync_running() {
        let loader = Arc::new(ScriptedLoader::new(vec![]));
        let indexer = Arc::new(Indexer::new(loader.clone(), config(30, 10_000)).await.unwrap());
        let sink = Arc::new(RecordingSink::default());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = {
            let indexer = Arc::clone(&indexer);
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { indexer.monitor(shutdown_rx, sink.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Drop every subscriber sender: the push stream closes.
        loader.subscribers.lock().unwrap().clear();
        loader.push_snapshot(vec![result("k1", TaskStatus::Running)]);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !indexer.list_task_keys().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "resync stopped after stream closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = shutdown_tx.send(true);
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn failed_initial_snapshot_fails_construction() {
        struct FailingLoader;

        #[async_trait]
        impl ExecutorLoader for FailingLoader {
            async fn list(&self) -> Result<Vec<TaskExecResult>> {
                anyhow::bail!("executor unavailable")
            }

            fn change_results(&self) -> mpsc::UnboundedReceiver<TaskExecResult> {
                mpsc::unbounded_channel().1
            }
        }

        let err = Indexer::new(Arc::new(FailingLoader), InformerConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("initial executor snapshot failed"));
    }
}
