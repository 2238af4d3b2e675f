//! Topic registry: which connections observe which topics.
//!
//! One `parking_lot` mutex guards the topic map and the connection index
//! together, so every mutation and every delivery snapshot is serialized
//! against every other. The lock is never held across an `.await`.
//!
//! Each topic also carries an async *gate*. Publishers hold it across
//! [`record_and_list`](TopicRegistry::record_and_list) and the fan-out that
//! follows, and joiners hold it across join and replay, which is what keeps
//! per-topic delivery in publish order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_core::{ConnectionId, Event, EventCategory, EventKind, TopicId};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, error};

use super::connection::{CloseReason, Connection};
use crate::errors::RegistryError;

/// Result of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// Subscribers on the topic, including the new one.
    pub subscriber_count: usize,
    /// Retained history, oldest first.
    pub replay: Vec<Arc<Event>>,
}

/// Per-topic counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopicStats {
    /// Topic key.
    pub topic: TopicId,
    /// Connections currently subscribed.
    pub subscriber_count: usize,
    /// When the topic was created.
    pub created_at: DateTime<Utc>,
    /// Last join, leave or publish.
    pub last_activity_at: DateTime<Utc>,
    /// Events retained for replay.
    pub history_length: usize,
    /// Most recent execution lifecycle event recorded on the topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_lifecycle: Option<EventKind>,
}

/// Registry-wide counters.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GlobalStats {
    /// Topics currently held, active or idle.
    pub active_topics: usize,
    /// Connections registered under any topic.
    pub total_connections: usize,
    /// Connections on the global topic.
    pub global_connections: usize,
    /// Distinct principals with at least one connection.
    pub active_principals: usize,
}

struct Topic {
    connections: Vec<Arc<Connection>>,
    history: VecDeque<Arc<Event>>,
    latest_lifecycle: Option<EventKind>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    gate: Arc<AsyncMutex<()>>,
}

impl Topic {
    fn new(history_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            connections: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
            latest_lifecycle: None,
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            gate: Arc::new(AsyncMutex::new(())),
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
        self.last_activity = Instant::now();
    }

    fn stats(&self, topic: &TopicId) -> TopicStats {
        TopicStats {
            topic: topic.clone(),
            subscriber_count: self.connections.len(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            history_length: self.history.len(),
            latest_lifecycle: self.latest_lifecycle,
        }
    }

    /// A gate clone exists outside the registry while a publish or join is
    /// in flight.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.gate) > 1
    }
}

#[derive(Default)]
struct Inner {
    topics: HashMap<TopicId, Topic>,
    index: HashMap<ConnectionId, TopicId>,
}

impl Inner {
    fn topic_mut(&mut self, topic: &TopicId, history_capacity: usize) -> &mut Topic {
        self.topics
            .entry(topic.clone())
            .or_insert_with(|| Topic::new(history_capacity))
    }

    fn remove(&mut self, id: &ConnectionId, reason: CloseReason) -> Option<Arc<Connection>> {
        let topic_id = self.index.remove(id)?;
        let topic = self.topics.get_mut(&topic_id)?;
        let pos = topic.connections.iter().position(|c| c.id() == id)?;
        let conn = topic.connections.remove(pos);
        topic.touch();
        let _ = conn.close(reason);
        Some(conn)
    }
}

/// Single source of truth for topic membership and replay history.
pub struct TopicRegistry {
    inner: Mutex<Inner>,
    history_capacity: usize,
}

impl TopicRegistry {
    /// Create a registry retaining `history_capacity` events per topic.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history_capacity: history_capacity.max(1),
        }
    }

    /// Events retained per topic.
    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Ordering gate for `topic`, creating the topic if absent.
    pub(crate) fn gate(&self, topic: &TopicId) -> Arc<AsyncMutex<()>> {
        let mut inner = self.inner.lock();
        Arc::clone(&inner.topic_mut(topic, self.history_capacity).gate)
    }

    /// Drop `topic` if it holds no connections and no history and the only
    /// gate clone outside the registry is the caller's.
    ///
    /// Undoes the lazy creation done by [`gate`](Self::gate) when the join
    /// that followed it failed.
    pub(crate) fn discard_unused(&self, topic: &TopicId) -> bool {
        let mut inner = self.inner.lock();
        let unused = inner.topics.get(topic).is_some_and(|t| {
            t.connections.is_empty() && t.history.is_empty() && Arc::strong_count(&t.gate) <= 2
        });
        if unused {
            let _ = inner.topics.remove(topic);
            debug!(%topic, "discarded unused topic");
        }
        unused
    }

    /// Register `conn` under `topic` and return the replay buffer.
    ///
    /// Fails if the connection has ever joined a topic before.
    pub fn join(&self, topic: &TopicId, conn: Arc<Connection>) -> Result<JoinOutcome, RegistryError> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.index.get(conn.id()) {
            let err = RegistryError::AlreadyJoined {
                connection_id: conn.id().clone(),
                topic: existing.clone(),
            };
            error!(conn_id = %conn.id(), %topic, error = %err, "rejected double join");
            return Err(err);
        }
        if let Err(existing) = conn.bind_topic(topic.clone()) {
            let err = RegistryError::AlreadyJoined {
                connection_id: conn.id().clone(),
                topic: existing,
            };
            error!(conn_id = %conn.id(), %topic, error = %err, "rejected rejoin of used connection");
            return Err(err);
        }

        let _ = inner.index.insert(conn.id().clone(), topic.clone());
        let entry = inner.topic_mut(topic, self.history_capacity);
        entry.connections.push(conn);
        entry.touch();

        Ok(JoinOutcome {
            subscriber_count: entry.connections.len(),
            replay: entry.history.iter().cloned().collect(),
        })
    }

    /// Remove a connection and close its transport normally.
    ///
    /// Returns `false` if it was not registered; calling twice is harmless.
    pub fn leave(&self, id: &ConnectionId) -> bool {
        self.evict(id, CloseReason::Normal)
    }

    /// Remove a connection and close its transport with `reason`.
    pub fn evict(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        let removed = self.inner.lock().remove(id, reason);
        if let Some(conn) = &removed {
            debug!(conn_id = %conn.id(), reason = reason.as_str(), "connection removed from registry");
        }
        removed.is_some()
    }

    /// Append `event` to the topic's history and snapshot its subscribers.
    ///
    /// Creates the topic if absent. The history never exceeds its capacity;
    /// the oldest entry is dropped first.
    pub fn record_and_list(&self, topic: &TopicId, event: Arc<Event>) -> Vec<Arc<Connection>> {
        let capacity = self.history_capacity;
        let mut inner = self.inner.lock();
        let entry = inner.topic_mut(topic, capacity);
        while entry.history.len() >= capacity {
            let _ = entry.history.pop_front();
        }
        if event.kind().category() == EventCategory::Lifecycle {
            entry.latest_lifecycle = Some(event.kind());
        }
        entry.history.push_back(event);
        entry.touch();
        entry.connections.clone()
    }

    /// Delete topics with no connections and no activity for `older_than`.
    ///
    /// Topics with a publish or join in flight are left alone.
    pub fn sweep_idle(&self, older_than: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.topics.len();
        inner.topics.retain(|topic, t| {
            let expired = t.connections.is_empty()
                && !t.in_use()
                && t.last_activity.elapsed() >= older_than;
            if expired {
                debug!(%topic, "reaping idle topic");
            }
            !expired
        });
        before - inner.topics.len()
    }

    /// Counters for one topic.
    pub fn stats(&self, topic: &TopicId) -> Option<TopicStats> {
        self.inner.lock().topics.get(topic).map(|t| t.stats(topic))
    }

    /// Registry-wide counters.
    pub fn global_stats(&self) -> GlobalStats {
        let inner = self.inner.lock();
        let principals: HashSet<_> = inner
            .topics
            .values()
            .flat_map(|t| t.connections.iter().map(|c| c.principal_id()))
            .collect();
        GlobalStats {
            active_topics: inner.topics.len(),
            total_connections: inner.index.len(),
            global_connections: inner
                .topics
                .get(&TopicId::global())
                .map_or(0, |t| t.connections.len()),
            active_principals: principals.len(),
        }
    }

    /// Counters for every topic, sorted by key.
    pub fn all_stats(&self) -> Vec<TopicStats> {
        let inner = self.inner.lock();
        let mut stats: Vec<_> = inner.topics.iter().map(|(id, t)| t.stats(id)).collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .topics
            .values()
            .flat_map(|t| t.connections.iter().cloned())
            .collect()
    }

    /// Look up a registered connection.
    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        let topic = inner.index.get(id)?;
        inner
            .topics
            .get(topic)?
            .connections
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Whether a connection is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Number of topics held.
    pub fn topic_count(&self) -> usize {
        self.inner.lock().topics.len()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Close every connection with `reason` and drop all topics.
    pub fn drain(&self, reason: CloseReason) -> usize {
        let mut inner = self.inner.lock();
        let mut closed = 0;
        for topic in inner.topics.values() {
            for conn in &topic.connections {
                if conn.close(reason) {
                    closed += 1;
                }
            }
        }
        inner.topics.clear();
        inner.index.clear();
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::test_support::connection;
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use relay_core::{ExecutionId, PrincipalId};

    fn e1() -> TopicId {
        TopicId::execution(&ExecutionId::from("E1"))
    }

    fn event(kind: EventKind) -> Arc<Event> {
        Arc::new(Event::new(kind).with_topic(e1()))
    }

    #[test]
    fn join_creates_topic_and_counts() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let (b, _rb) = connection("b", 2, 8);
        assert_eq!(reg.join(&e1(), a).unwrap().subscriber_count, 1);
        assert_eq!(reg.join(&e1(), b).unwrap().subscriber_count, 2);
        assert_eq!(reg.stats(&e1()).unwrap().subscriber_count, 2);
        assert_eq!(reg.topic_count(), 1);
    }

    #[test]
    fn double_join_rejected_without_side_effects() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        let err = reg.join(&TopicId::global(), Arc::clone(&a)).unwrap_err();
        assert_matches!(err, RegistryError::AlreadyJoined { ref topic, .. } if *topic == e1());
        assert!(reg.stats(&TopicId::global()).is_none());
        assert_eq!(reg.stats(&e1()).unwrap().subscriber_count, 1);
    }

    #[test]
    fn rejoin_after_leave_rejected() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        assert!(reg.leave(a.id()));
        assert!(reg.join(&e1(), a).is_err());
    }

    #[test]
    fn leave_is_idempotent_and_closes() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        assert!(reg.leave(a.id()));
        assert!(!reg.leave(a.id()));
        assert!(!reg.leave(&ConnectionId::from("never-joined")));
        assert!(a.is_closed());
        assert_eq!(a.close_reason(), Some(CloseReason::Normal));
        assert_eq!(reg.stats(&e1()).unwrap().subscriber_count, 0);
    }

    #[test]
    fn evict_records_reason() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        assert!(reg.evict(a.id(), CloseReason::SendFailed));
        assert_eq!(a.close_reason(), Some(CloseReason::SendFailed));
        assert!(!reg.contains(a.id()));
    }

    #[test]
    fn publish_without_subscribers_retains_history() {
        let reg = TopicRegistry::new(10);
        let recipients = reg.record_and_list(&e1(), event(EventKind::ExecutionStarted));
        assert!(recipients.is_empty());
        let stats = reg.stats(&e1()).unwrap();
        assert_eq!(stats.history_length, 1);
        assert_eq!(stats.latest_lifecycle, Some(EventKind::ExecutionStarted));

        let (a, _ra) = connection("a", 1, 8);
        let outcome = reg.join(&e1(), a).unwrap();
        assert_eq!(outcome.replay.len(), 1);
        assert_eq!(outcome.replay[0].kind(), EventKind::ExecutionStarted);
    }

    #[test]
    fn snapshot_excludes_later_joiners() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        let snapshot = reg.record_and_list(&e1(), event(EventKind::ExecutionProgress));
        let (b, _rb) = connection("b", 2, 8);
        let outcome = reg.join(&e1(), b).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), a.id());
        assert_eq!(outcome.replay.len(), 1);
    }

    #[test]
    fn lifecycle_tracking_ignores_other_kinds() {
        let reg = TopicRegistry::new(10);
        let _ = reg.record_and_list(&e1(), event(EventKind::ExecutionCompleted));
        let _ = reg.record_and_list(&e1(), event(EventKind::LogMessage));
        assert_eq!(
            reg.stats(&e1()).unwrap().latest_lifecycle,
            Some(EventKind::ExecutionCompleted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_respects_grace_and_activity() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        let _ = reg.leave(a.id());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 0);
        assert!(reg.stats(&e1()).is_some());

        let _ = reg.record_and_list(&e1(), event(EventKind::LogMessage));
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 1);
        assert_eq!(reg.global_stats().active_topics, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_active_topics() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), a).unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_gated_topics() {
        let reg = TopicRegistry::new(10);
        let gate = reg.gate(&e1());
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 0);
        drop(gate);
        assert_eq!(reg.sweep_idle(Duration::from_secs(60)), 1);
    }

    #[test]
    fn global_stats_counts() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let (b, _rb) = connection("b", 1, 8);
        let (c, _rc) = connection("c", 9, 8);
        let _ = reg.join(&e1(), a).unwrap();
        let _ = reg.join(&TopicId::user(PrincipalId::new(1)), b).unwrap();
        let _ = reg.join(&TopicId::global(), c).unwrap();
        let stats = reg.global_stats();
        assert_eq!(stats.active_topics, 3);
        assert_eq!(stats.total_connections, 3);
        assert_eq!(stats.global_connections, 1);
        assert_eq!(stats.active_principals, 2);
    }

    #[test]
    fn drain_closes_everything() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let (b, _rb) = connection("b", 2, 8);
        let _ = reg.join(&e1(), Arc::clone(&a)).unwrap();
        let _ = reg.join(&TopicId::global(), Arc::clone(&b)).unwrap();
        assert_eq!(reg.drain(CloseReason::ShuttingDown), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::ShuttingDown));
        assert!(b.is_closed());
        assert_eq!(reg.topic_count(), 0);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn discard_unused_keeps_topics_with_state() {
        let reg = TopicRegistry::new(10);

        let gate = reg.gate(&TopicId::global());
        assert!(reg.discard_unused(&TopicId::global()));
        assert!(reg.stats(&TopicId::global()).is_none());
        drop(gate);

        let gate = reg.gate(&e1());
        let _ = reg.record_and_list(&e1(), Arc::new(Event::new(EventKind::LogMessage)));
        assert!(!reg.discard_unused(&e1()));
        drop(gate);

        let topic = TopicId::user(PrincipalId::new(3));
        let ours = reg.gate(&topic);
        let waiting = reg.gate(&topic);
        assert!(!reg.discard_unused(&topic));
        drop((ours, waiting));
        assert_eq!(reg.topic_count(), 2);
    }

    #[test]
    fn connection_lookup() {
        let reg = TopicRegistry::new(10);
        let (a, _ra) = connection("a", 1, 8);
        let _ = reg.join(&e1(), a).unwrap();
        assert!(reg.connection(&ConnectionId::from("a")).is_some());
        assert!(reg.connection(&ConnectionId::from("b")).is_none());
        assert_eq!(reg.connections().len(), 1);
    }

    proptest! {
        #[test]
        fn history_is_bounded_fifo(capacity in 1usize..16, count in 0usize..64) {
            let reg = TopicRegistry::new(capacity);
            let events: Vec<_> = (0..count).map(|_| event(EventKind::LogMessage)).collect();
            for ev in &events {
                let _ = reg.record_and_list(&e1(), Arc::clone(ev));
            }
            let (a, _ra) = connection("a", 1, 8);
            let replay = reg.join(&e1(), a).unwrap().replay;
            prop_assert!(replay.len() <= capacity);
            prop_assert_eq!(replay.len(), count.min(capacity));
            let expected: Vec<_> = events[count.saturating_sub(capacity)..]
                .iter()
                .map(|e| e.event_id().clone())
                .collect();
            let actual: Vec<_> = replay.iter().map(|e| e.event_id().clone()).collect();
            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn snapshot_matches_membership(ops in proptest::collection::vec(0u8..3, 1..40)) {
            let reg = TopicRegistry::new(4);
            let mut members: Vec<ConnectionId> = Vec::new();
            let mut receivers = Vec::new();
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    0 => {
                        let (c, rx) = connection(&format!("c{i}"), 1, 4);
                        members.push(c.id().clone());
                        receivers.push(rx);
                        let _ = reg.join(&e1(), c).unwrap();
                    }
                    1 if !members.is_empty() => {
                        let id = members.remove(0);
                        prop_assert!(reg.leave(&id));
                    }
                    _ => {
                        let snapshot: Vec<_> = reg
                            .record_and_list(&e1(), event(EventKind::LogMessage))
                            .iter()
                            .map(|c| c.id().clone())
                            .collect();
                        prop_assert_eq!(&snapshot, &members);
                    }
                }
            }
        }
    }
}
