//! Fan-in of the two reconciliation triggers: runnable-set watch events and
//! the periodic resync ticker.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::InformerConfig;
use crate::recorder::Recorder;

/// One reconciliation impulse. `resync` widens the real side of the diff to
/// every cached task, so tasks that fell out of the desired set get stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub task_keys: Vec<String>,
    pub resync: bool,
}

/// Receiving half of the trigger fan-in. Two feeder tasks write into it:
/// the watch feeder (reconnecting under backoff when the stream breaks) and
/// the resync ticker. Feeders stop on shutdown or when the consumer goes
/// away.
pub struct Trigger {
    rx: mpsc::Receiver<TriggerInfo>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger").finish_non_exhaustive()
    }
}

impl Trigger {
    /// Fire the initial full-resync tick synchronously, then start both
    /// feeders. A failure to list the runnable set here is a startup
    /// failure: an informer that cannot see its desired set must not run.
    pub async fn start(
        recorder: Arc<dyn Recorder>,
        worker_id: &str,
        config: &InformerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.trigger_buffer.max(1));

        let keys = recorder
            .list_runnable_tasks(worker_id)
            .await
            .context("listing runnable tasks for the initial tick failed")?;
        let _ = tx
            .send(TriggerInfo {
                task_keys: keys,
                resync: true,
            })
            .await;

        tokio::spawn(resync_feeder(
            Arc::clone(&recorder),
            worker_id.to_string(),
            config.resync_interval,
            tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(watch_feeder(
            recorder,
            worker_id.to_string(),
            config.clone(),
            tx,
            shutdown,
        ));

        Ok(Self { rx })
    }

    /// Next impulse, or `None` once both feeders have stopped.
    pub async fn recv(&mut self) -> Option<TriggerInfo> {
        self.rx.recv().await
    }
}

async fn resync_feeder(
    recorder: Arc<dyn Recorder>,
    worker_id: String,
    resync_interval: Duration,
    tx: mpsc::Sender<TriggerInfo>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(resync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The initial tick was already sent synchronously at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match recorder.list_runnable_tasks(&worker_id).await {
                    Ok(task_keys) => {
                        if tx.send(TriggerInfo { task_keys, resync: true }).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(error = ?err, "listing runnable tasks failed; skipping resync tick");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn watch_feeder(
    recorder: Arc<dyn Recorder>,
    worker_id: String,
    config: InformerConfig,
    tx: mpsc::Sender<TriggerInfo>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return;
        }

        match recorder.watch_runnable_tasks(&worker_id).await {
            Ok(mut events) => {
                attempt = 0;
                info!(worker_id = %worker_id, "runnable task watch established");
                loop {
                    tokio::select! {
                        maybe = events.recv() => match maybe {
                            Some(task_keys) => {
                                if tx.send(TriggerInfo { task_keys, resync: false }).await.is_err() {
                                    return;
                                }
                            }
                            None => {
                                warn!(worker_id = %worker_id, "runnable task watch closed; reconnecting");
                                break;
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(worker_id = %worker_id, error = ?err, "establishing runnable task watch failed");
            }
        }

        attempt += 1;
        let delay_ms = config
            .watch_backoff
            .calculate_delay_ms(attempt as i32)
            .min(config.watch_backoff_max.as_millis() as i64);
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
