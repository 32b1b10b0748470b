use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::farm_service::FarmScheduler;

/// Periodically looks for farming cycles that went silent.
pub struct StallWatchdog {
    farm: Arc<FarmScheduler>,
    interval: Duration,
}

impl StallWatchdog {
    pub fn new(farm: Arc<FarmScheduler>, interval: Duration) -> Self {
        Self { farm, interval }
    }

    pub async fn tick(&self) -> Vec<String> {
        let stalled = self.farm.check_stalls().await;
        if !stalled.is_empty() {
            debug!(count = stalled.len(), "Watchdog marked cycles stalled");
        }
        stalled
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "StallWatchdog started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!("StallWatchdog shutting down");
                    break;
                }
            }
        }
    }
}
