//! Background training scheduler.
//!
//! Runs [`OptimizationEngine::train_tick`] on a fixed interval in a spawned
//! task, so model updates stay off the request path. Shutdown is
//! cooperative: [`TrainingScheduler::shutdown`] signals the loop and awaits
//! the task, never aborting a cycle midway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::OptimizationEngine;

/// Handle to the periodic training task.
#[derive(Debug)]
pub struct TrainingScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TrainingScheduler {
    /// Spawn the training loop for `engine`, running one cycle every
    /// `interval`.
    ///
    /// The first cycle runs after one full interval, not immediately: a
    /// freshly started engine has no samples worth training on.
    pub fn spawn(engine: Arc<OptimizationEngine>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval() fires immediately; swallow the first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("training cycle starting");
                        engine.train_tick();
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("training scheduler shutting down");
                            return;
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Convenience: spawn with the interval from the engine's own config.
    pub fn spawn_from_config(engine: Arc<OptimizationEngine>) -> Self {
        let minutes = engine.config().ml.training_interval_minutes;
        Self::spawn(engine, Duration::from_secs(minutes * 60))
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Any cycle already in progress completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }

    /// True while the training task is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Arc<OptimizationEngine> {
        Arc::new(OptimizationEngine::new(EngineConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_task() {
        let scheduler = TrainingScheduler::spawn(engine(), Duration::from_secs(3600));
        assert!(scheduler.is_running());
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_run_on_the_interval() {
        let engine = engine();
        let scheduler = TrainingScheduler::spawn(Arc::clone(&engine), Duration::from_secs(60));

        // No cycle before the first interval elapses.
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;

        // Crossing the interval boundary runs a cycle; the cycle on an empty
        // store is a no-op beyond pruning, so reaching here without a hang is
        // the assertion.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_from_config_uses_configured_interval() {
        let scheduler = TrainingScheduler::spawn_from_config(engine());
        assert!(scheduler.is_running());
        scheduler.shutdown().await;
    }
}
