//! Periodic background checkpointing.

use super::VectorIndex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

/// Handle to a running checkpointer. Dropping it leaves the task running
/// until the runtime shuts down; call [`CheckpointHandle::shutdown`] to stop
/// it with a final checkpoint.
pub struct CheckpointHandle {
    shutdown_notify: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Checkpoints `index` every `interval` until shut down.
pub fn spawn_checkpointer(index: Arc<VectorIndex>, interval: Duration) -> CheckpointHandle {
    let shutdown_notify = Arc::new(Notify::new());
    let notified = Arc::clone(&shutdown_notify);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = index.checkpoint().await {
                        error!("Periodic checkpoint of {} failed: {}", index.location(), e);
                    }
                }
                _ = notified.notified() => {
                    debug!("Checkpointer shutdown signal received");
                    break;
                }
            }
        }

        if let Err(e) = index.checkpoint().await {
            error!("Final checkpoint of {} failed: {}", index.location(), e);
        }
    });

    CheckpointHandle {
        shutdown_notify,
        task,
    }
}

impl CheckpointHandle {
    /// Stops the loop and waits for the final checkpoint.
    pub async fn shutdown(self) {
        // notify_one stores a permit, so the signal is not lost while a
        // checkpoint is in flight.
        self.shutdown_notify.notify_one();
        if let Err(e) = self.task.await {
            error!("Checkpointer task failed: {}", e);
        }
    }
}
