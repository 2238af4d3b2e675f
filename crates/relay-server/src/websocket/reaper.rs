//! Periodic deletion of idle topics.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::TopicRegistry;
use crate::metrics::TOPICS_REAPED_TOTAL;

/// Deletes topics that have had no connections for longer than the grace
/// period.
pub struct TopicReaper {
    registry: Arc<TopicRegistry>,
    interval: Duration,
    grace: Duration,
}

impl TopicReaper {
    /// Create a reaper.
    pub fn new(registry: Arc<TopicRegistry>, interval: Duration, grace: Duration) -> Self {
        Self {
            registry,
            interval,
            grace,
        }
    }

    /// Run one sweep and return the number of topics removed.
    pub fn sweep_once(&self) -> usize {
        let removed = self.registry.sweep_idle(self.grace);
        if removed > 0 {
            counter!(TOPICS_REAPED_TOTAL).increment(removed as u64);
            info!(removed, remaining = self.registry.topic_count(), "reaped idle topics");
        } else {
            debug!("no idle topics to reap");
        }
        removed
    }

    /// Run until `cancel` fires, one sweep per interval.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.interval.as_secs(),
            grace_secs = self.grace.as_secs(),
            "topic reaper started"
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = self.sweep_once();
                }
            }
        }
        info!("topic reaper stopped");
    }
}
