//! Liveness monitoring across all registered connections.
//!
//! Each cycle probes every connection with a `heartbeat` frame (the writer
//! task follows it with a WebSocket Ping). A probe that cannot be queued
//! evicts the connection, and so does silence: a connection whose last
//! acknowledgement is older than the liveness timeout is dropped even if
//! probes are still being accepted.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use relay_core::{Event, EventKind};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broadcast::Broadcaster;
use super::connection::CloseReason;
use super::registry::TopicRegistry;

/// Counters from one monitor cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LivenessSweep {
    /// Probes queued successfully.
    pub probed: usize,
    /// Connections dropped for missing the liveness deadline.
    pub timed_out: usize,
    /// Connections dropped because the probe could not be sent.
    pub probe_failed: usize,
}

/// Periodic prober for every registered connection.
pub struct LivenessMonitor {
    registry: Arc<TopicRegistry>,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    /// Create a monitor. `timeout` is normally twice `interval`.
    pub fn new(
        registry: Arc<TopicRegistry>,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            interval,
            timeout,
        }
    }

    /// Run one cycle over the current connection snapshot.
    pub async fn sweep_once(&self) -> LivenessSweep {
        let mut sweep = LivenessSweep::default();
        let snapshot = self.registry.connections();
        if snapshot.is_empty() {
            return sweep;
        }

        let mut to_probe = Vec::with_capacity(snapshot.len());
        for conn in snapshot {
            let silent_for = conn.last_liveness_elapsed();
            if silent_for > self.timeout {
                warn!(
                    conn_id = %conn.id(),
                    silent_secs = silent_for.as_secs(),
                    "liveness deadline missed"
                );
                if self.broadcaster.evict(&conn, CloseReason::LivenessTimeout) {
                    sweep.timed_out += 1;
                }
            } else {
                to_probe.push(conn);
            }
        }

        let frame = match Event::new(EventKind::Heartbeat).to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(error = %e, "failed to serialize heartbeat");
                return sweep;
            }
        };
        let send_timeout = self.broadcaster.send_timeout();
        let results = join_all(
            to_probe
                .iter()
                .map(|conn| conn.probe(Arc::clone(&frame), send_timeout)),
        )
        .await;

        for (conn, result) in to_probe.iter().zip(results) {
            match result {
                Ok(()) => sweep.probed += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id(), error = %e, "liveness probe failed");
                    if self.broadcaster.evict(conn, CloseReason::SendFailed) {
                        sweep.probe_failed += 1;
                    }
                }
            }
        }
        sweep
    }

    /// Run until `cancel` fires, one cycle per interval.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "liveness monitor started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sweep = self.sweep_once().await;
                    if sweep.timed_out + sweep.probe_failed > 0 {
                        info!(
                            probed = sweep.probed,
                            timed_out = sweep.timed_out,
                            probe_failed = sweep.probe_failed,
                            "liveness cycle evicted connections"
                        );
                    } else {
                        debug!(probed = sweep.probed, "liveness cycle complete");
                    }
                }
            }
        }
        info!("liveness monitor stopped");
    }
}
