//! Periodic purge of expired window records.
//!
//! Correctness never depends on the sweeper, since every check ignores stale
//! records on its own. It exists to bound memory when keys are unbounded,
//! such as raw client addresses.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::store::WindowStore;
use crate::error::{Result, TurnstileError};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sweeps a set of named stores on a fixed interval.
pub struct Sweeper {
    stores: Vec<(String, Arc<WindowStore>)>,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    /// Create a sweeper with no stores attached.
    pub fn new(interval: Duration) -> Self {
        Self::with_clock(interval, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores: Vec::new(),
            interval,
            clock,
        }
    }

    /// Attach a store, labelled for logging.
    pub fn watch(mut self, name: impl Into<String>, store: Arc<WindowStore>) -> Self {
        self.stores.push((name.into(), store));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sweep every attached store once and return the total removed.
    pub fn sweep_once(&self) -> usize {
        let now = self.clock.now();
        let mut total = 0;

        for (name, store) in &self.stores {
            let removed = store.sweep(now);
            if removed > 0 {
                debug!(policy = %name, removed, remaining = store.len(), "Swept expired records");
            }
            total += removed;
        }

        total
    }

    /// Run the sweep loop on the current tokio runtime.
    ///
    /// The loop ends when [`SweeperHandle::shutdown`] is called or the handle
    /// is dropped.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!(
            interval_secs = self.interval.as_secs_f64(),
            stores = self.stores.len(),
            "Starting sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can have expired yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_once();
                        trace!(removed, "Sweep finished");
                    }
                    _ = &mut shutdown_rx => {
                        info!("Sweeper stopped");
                        break;
                    }
                }
            }
        });

        SweeperHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// Owner of a running sweep loop.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The loop may already be gone; joining below reports that.
            let _ = tx.send(());
        }

        (&mut self.task)
            .await
            .map_err(|e| TurnstileError::Shutdown(format!("sweeper task failed: {}", e)))
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
