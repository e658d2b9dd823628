//! Snapshot Scheduler
//!
//! Background task that periodically writes an engine snapshot.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::Snapshot;
use crate::engine::FaceEngine;

/// Periodic snapshot task
pub struct SnapshotScheduler {
    engine: FaceEngine,
    snapshot: Arc<Snapshot>,
    interval: Duration,
}

impl SnapshotScheduler {
    /// Create a new scheduler using the snapshot's configured interval
    pub fn new(engine: FaceEngine, snapshot: Arc<Snapshot>) -> Self {
        let interval = Duration::from_secs(snapshot.config().interval_secs);
        Self {
            engine,
            snapshot,
            interval,
        }
    }

    /// Override the tick interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Write one snapshot on a blocking thread
    pub async fn save_now(&self) -> bool {
        let data = match self.engine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Snapshot capture failed");
                return false;
            }
        };
        let snapshot = Arc::clone(&self.snapshot);

        match tokio::task::spawn_blocking(move || snapshot.save(&data)).await {
            Ok(Ok(path)) => {
                debug!(path = %path.display(), "Periodic snapshot written");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "Snapshot failed");
                false
            }
            Err(e) => {
                error!(error = %e, "Snapshot task panicked");
                false
            }
        }
    }

    /// Run the scheduler (should be spawned as a task)
    pub async fn run(self) {
        if self.interval.is_zero() {
            info!("Periodic snapshots disabled");
            return;
        }

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        info!("Snapshot scheduler started, interval: {:?}", self.interval);

        loop {
            ticker.tick().await;
            self.save_now().await;
        }
    }

    /// Spawn the scheduler as a background task
    pub fn spawn(engine: FaceEngine, snapshot: Arc<Snapshot>) -> tokio::task::JoinHandle<()> {
        let scheduler = Self::new(engine, snapshot);
        tokio::spawn(scheduler.run())
    }
}
