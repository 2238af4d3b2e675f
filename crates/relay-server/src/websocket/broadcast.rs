//! Event fan-out to subscribed connections.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use relay_core::{Event, TopicId};
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection};
use super::registry::TopicRegistry;
use crate::errors::DeliveryError;
use crate::metrics::{DELIVERIES_TOTAL, EVENTS_PUBLISHED_TOTAL, EVICTIONS_TOTAL};

/// Outcome of one publish, for logging and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections in the delivery snapshot of the primary topic.
    pub recipients: usize,
    /// Successful deliveries on the primary topic.
    pub delivered: usize,
    /// Connections evicted on the primary topic.
    pub evicted: usize,
    /// Successful deliveries to global observers.
    pub forwarded: usize,
}

#[derive(Default)]
struct FanOut {
    recipients: usize,
    delivered: usize,
    evicted: usize,
}

/// Delivers events to every subscriber of a topic, evicting failures.
pub struct Broadcaster {
    registry: Arc<TopicRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<TopicRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Bound on one send to one connection.
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Record `event` on `topic` and deliver it to every subscriber.
    ///
    /// Never fails: connections whose send fails or times out are evicted
    /// after the fan-out completes. Execution-scoped events are forwarded to
    /// the global topic while the execution topic's gate is still held, so
    /// global observers see each execution's events in order too.
    pub async fn publish(&self, topic: &TopicId, event: Arc<Event>) -> PublishReport {
        let frame = match event.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(event_type = %event.kind(), %topic, error = %e, "failed to serialize event");
                return PublishReport::default();
            }
        };
        counter!(EVENTS_PUBLISHED_TOTAL, "topic_kind" => topic.kind().as_str()).increment(1);

        let gate = self.registry.gate(topic);
        let _ordered = gate.lock().await;
        let primary = self.fan_out(topic, &event, &frame).await;

        let mut forwarded = 0;
        if topic.is_execution_scoped() {
            let global = TopicId::global();
            let global_gate = self.registry.gate(&global);
            let _global_ordered = global_gate.lock().await;
            forwarded = self.fan_out(&global, &event, &frame).await.delivered;
        }

        debug!(
            event_type = %event.kind(),
            %topic,
            recipients = primary.recipients,
            evicted = primary.evicted,
            forwarded,
            "published event"
        );
        PublishReport {
            recipients: primary.recipients,
            delivered: primary.delivered,
            evicted: primary.evicted,
            forwarded,
        }
    }

    /// Deliver one event to one connection, outside any topic.
    ///
    /// A failed send evicts the connection and the error is returned.
    pub async fn send_to(&self, conn: &Connection, event: &Event) -> Result<(), DeliveryError> {
        let frame = match event.to_json() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(event_type = %event.kind(), error = %e, "failed to serialize event");
                return Ok(());
            }
        };
        match conn.deliver(frame, self.send_timeout).await {
            Ok(()) => {
                counter!(DELIVERIES_TOTAL).increment(1);
                Ok(())
            }
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "direct send failed, evicting");
                let _ = self.evict(conn, CloseReason::SendFailed);
                Err(e)
            }
        }
    }

    async fn fan_out(&self, topic: &TopicId, event: &Arc<Event>, frame: &Arc<String>) -> FanOut {
        let recipients = self.registry.record_and_list(topic, Arc::clone(event));
        let results = join_all(
            recipients
                .iter()
                .map(|conn| conn.deliver(Arc::clone(frame), self.send_timeout)),
        )
        .await;

        let mut out = FanOut {
            recipients: recipients.len(),
            ..FanOut::default()
        };
        let mut to_evict = Vec::new();
        for (conn, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => out.delivered += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id(), %topic, error = %e, "failed to send event to client");
                    to_evict.push(conn);
                }
            }
        }
        counter!(DELIVERIES_TOTAL).increment(out.delivered as u64);

        for conn in to_evict {
            if self.evict(conn, CloseReason::SendFailed) {
                out.evicted += 1;
            }
        }
        out
    }

    /// Remove a connection from the registry and close it with `reason`.
    pub fn evict(&self, conn: &Connection, reason: CloseReason) -> bool {
        let removed = self.registry.evict(conn.id(), reason);
        if removed {
            counter!(EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
            warn!(conn_id = %conn.id(), reason = reason.as_str(), "evicted connection");
        } else {
            let _ = conn.close(reason);
        }
        removed
    }
}
