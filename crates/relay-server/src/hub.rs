//! Session facade for the realtime layer.
//!
//! [`RealtimeHub`] is what the WebSocket handler calls when a client attaches
//! or detaches and what the execution engine calls to emit lifecycle and step
//! events. It owns the topic registry, the broadcaster and the background
//! loops; nothing else holds registry state.

use std::sync::Arc;

use relay_core::{
    Event, EventKind, ExecutionId, PrincipalId, StepId, TopicId, TopicKind, WorkspaceId,
    into_payload,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{Authenticator, EntitlementChecker, Identity};
use crate::config::RealtimeConfig;
use crate::errors::{AuthError, DeliveryError, SubscribeError};
use crate::status::StatusProvider;
use crate::websocket::broadcast::{Broadcaster, PublishReport};
use crate::websocket::connection::{CloseReason, Connection};
use crate::websocket::heartbeat::LivenessMonitor;
use crate::websocket::reaper::TopicReaper;
use crate::websocket::registry::{GlobalStats, TopicRegistry, TopicStats};

/// Entry point for connection handlers and event producers.
pub struct RealtimeHub {
    registry: Arc<TopicRegistry>,
    broadcaster: Arc<Broadcaster>,
    authenticator: Arc<dyn Authenticator>,
    entitlements: Arc<dyn EntitlementChecker>,
    status: Option<Arc<dyn StatusProvider>>,
    config: RealtimeConfig,
}

impl RealtimeHub {
    /// Create a hub with its own registry.
    pub fn new(
        config: RealtimeConfig,
        authenticator: Arc<dyn Authenticator>,
        entitlements: Arc<dyn EntitlementChecker>,
    ) -> Self {
        let registry = Arc::new(TopicRegistry::new(config.history_capacity));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), config.send_timeout));
        Self {
            registry,
            broadcaster,
            authenticator,
            entitlements,
            status: None,
            config,
        }
    }

    /// Attach an authoritative status source for `request_status`.
    #[must_use]
    pub fn with_status_provider(mut self, provider: Arc<dyn StatusProvider>) -> Self {
        self.status = Some(provider);
        self
    }

    /// Underlying registry.
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Underlying broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Tuning in effect.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ── Connection side ─────────────────────────────────────────────────

    /// Validate a handshake credential.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        match credential.map(str::trim).filter(|c| !c.is_empty()) {
            Some(token) => self.authenticator.authenticate(token).await,
            None => Err(AuthError::MissingCredential),
        }
    }

    /// Authorize and register `conn` under the topic `kind`/`scope`.
    ///
    /// On success the connection has been sent, in order, a
    /// `connection_status` event, a `subscription_confirmed` event and the
    /// topic's replay buffer. No live event can interleave with these because
    /// the topic's gate is held throughout.
    pub async fn subscribe(
        &self,
        kind: TopicKind,
        scope: Option<&str>,
        conn: &Arc<Connection>,
    ) -> Result<TopicId, SubscribeError> {
        let topic = TopicId::new(kind, scope)?;
        if !self.entitlements.is_entitled(conn.identity(), &topic).await {
            warn!(conn_id = %conn.id(), principal = %conn.principal_id(), %topic, "subscription refused");
            return Err(SubscribeError::NotEntitled {
                principal: conn.principal_id(),
                topic,
            });
        }

        let gate = self.registry.gate(&topic);
        let _ordered = gate.lock().await;
        let outcome = match self.registry.join(&topic, Arc::clone(conn)) {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = self.registry.discard_unused(&topic);
                return Err(e.into());
            }
        };

        let status = Event::new(EventKind::ConnectionStatus).with_payload(into_payload(json!({
            "status": "connected",
            "connection_id": conn.id(),
            "topic": topic,
            "subscriber_count": outcome.subscriber_count,
        })));
        let confirmed = Event::new(EventKind::SubscriptionConfirmed).with_payload(into_payload(json!({
            "topic": topic,
            "replayed": outcome.replay.len(),
        })));

        let preamble = [status, confirmed];
        let replay = outcome.replay.iter().map(|event| &**event);
        for event in preamble.iter().chain(replay) {
            if let Err(e) = self.broadcaster.send_to(conn, event).await {
                warn!(conn_id = %conn.id(), %topic, error = %e, "join preamble failed");
                let _ = self.registry.discard_unused(&topic);
                return Err(SubscribeError::ConnectionClosed);
            }
        }

        info!(
            conn_id = %conn.id(),
            %topic,
            subscribers = outcome.subscriber_count,
            replayed = outcome.replay.len(),
            "connection joined topic"
        );
        Ok(topic)
    }

    /// Remove a connection from its topic. Idempotent.
    pub fn unsubscribe(&self, conn: &Connection) -> bool {
        let removed = self.registry.leave(conn.id());
        if removed {
            info!(conn_id = %conn.id(), topic = ?conn.topic(), "connection left topic");
        }
        removed
    }

    // ── Producer side ───────────────────────────────────────────────────

    /// Record and fan out an event on `topic`.
    pub async fn publish(&self, topic: &TopicId, event: Event) -> PublishReport {
        let event = Arc::new(event.with_topic(topic.clone()));
        self.broadcaster.publish(topic, event).await
    }

    async fn execution_event(
        &self,
        kind: EventKind,
        execution: &ExecutionId,
        step: Option<&StepId>,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        let mut event = Event::new(kind)
            .with_principal(principal)
            .with_payload(into_payload(payload));
        if let Some(step) = step {
            event = event.with_step(step.clone());
        }
        self.publish(&TopicId::execution(execution), event).await
    }

    /// Execution began running.
    pub async fn execution_started(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::ExecutionStarted, execution, None, principal, payload)
            .await
    }

    /// Execution reported progress.
    pub async fn execution_progress(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::ExecutionProgress, execution, None, principal, payload)
            .await
    }

    /// Execution finished successfully.
    pub async fn execution_completed(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::ExecutionCompleted, execution, None, principal, payload)
            .await
    }

    /// Execution finished with an error.
    pub async fn execution_failed(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::ExecutionFailed, execution, None, principal, payload)
            .await
    }

    /// Execution was cancelled.
    pub async fn execution_cancelled(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::ExecutionCancelled, execution, None, principal, payload)
            .await
    }

    /// A step began.
    pub async fn step_started(
        &self,
        execution: &ExecutionId,
        step: &StepId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::StepStarted, execution, Some(step), principal, payload)
            .await
    }

    /// A step reported progress.
    pub async fn step_progress(
        &self,
        execution: &ExecutionId,
        step: &StepId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::StepProgress, execution, Some(step), principal, payload)
            .await
    }

    /// A step finished successfully.
    pub async fn step_completed(
        &self,
        execution: &ExecutionId,
        step: &StepId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::StepCompleted, execution, Some(step), principal, payload)
            .await
    }

    /// A step failed.
    pub async fn step_failed(
        &self,
        execution: &ExecutionId,
        step: &StepId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::StepFailed, execution, Some(step), principal, payload)
            .await
    }

    /// A step was skipped.
    pub async fn step_skipped(
        &self,
        execution: &ExecutionId,
        step: &StepId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::StepSkipped, execution, Some(step), principal, payload)
            .await
    }

    /// A log line produced by the execution.
    pub async fn log_message(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::LogMessage, execution, None, principal, payload)
            .await
    }

    /// A performance sample produced by the execution.
    pub async fn performance_update(
        &self,
        execution: &ExecutionId,
        principal: PrincipalId,
        payload: Value,
    ) -> PublishReport {
        self.execution_event(EventKind::PerformanceMetric, execution, None, principal, payload)
            .await
    }

    /// Publish to a user's personal topic.
    pub async fn notify_user(
        &self,
        principal: PrincipalId,
        kind: EventKind,
        payload: Value,
    ) -> PublishReport {
        let event = Event::new(kind)
            .with_principal(principal)
            .with_payload(into_payload(payload));
        self.publish(&TopicId::user(principal), event).await
    }

    /// Publish to a workspace topic.
    pub async fn notify_workspace(
        &self,
        workspace: &WorkspaceId,
        kind: EventKind,
        payload: Value,
    ) -> PublishReport {
        let event = Event::new(kind).with_payload(into_payload(payload));
        self.publish(&TopicId::workspace(workspace), event).await
    }

    /// Deliver a control event to one registered connection, outside any
    /// topic history.
    pub async fn send_to_connection(
        &self,
        conn_id: &relay_core::ConnectionId,
        kind: EventKind,
        payload: Value,
    ) -> Result<(), DeliveryError> {
        let conn = self.registry.connection(conn_id).ok_or(DeliveryError::Closed)?;
        let event = Event::new(kind).with_payload(into_payload(payload));
        self.broadcaster.send_to(&conn, &event).await
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// `status_update` event for `topic`.
    ///
    /// Uses the status provider when one is attached and knows the
    /// execution; otherwise derives the status from the topic's latest
    /// lifecycle event.
    pub async fn status_snapshot(&self, topic: &TopicId) -> Event {
        let stats = self.registry.stats(topic);
        let subscriber_count = stats.as_ref().map_or(0, |s| s.subscriber_count);
        let history_length = stats.as_ref().map_or(0, |s| s.history_length);

        let provided = match (&self.status, topic.execution_id()) {
            (Some(provider), Some(execution)) => provider.execution_status(&execution).await,
            _ => None,
        };
        let mut payload = provided.unwrap_or_else(|| {
            let status = stats
                .as_ref()
                .and_then(|s| s.latest_lifecycle)
                .and_then(EventKind::execution_status)
                .unwrap_or("pending");
            into_payload(json!({
                "status": status,
                "last_activity_at": stats.as_ref().map(|s| s.last_activity_at),
            }))
        });
        let _ = payload.insert("subscriber_count".into(), json!(subscriber_count));
        let _ = payload.insert("history_length".into(), json!(history_length));

        Event::new(EventKind::StatusUpdate)
            .with_topic(topic.clone())
            .with_payload(payload)
    }

    /// Counters for one topic.
    pub fn stats(&self, topic: &TopicId) -> Option<TopicStats> {
        self.registry.stats(topic)
    }

    /// Registry-wide counters.
    pub fn global_stats(&self) -> GlobalStats {
        self.registry.global_stats()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Start the liveness monitor and topic reaper.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let monitor = LivenessMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.broadcaster),
            self.config.liveness_interval,
            self.config.liveness_timeout,
        );
        let reaper = TopicReaper::new(
            Arc::clone(&self.registry),
            self.config.reaper_interval,
            self.config.topic_grace,
        );
        vec![
            tokio::spawn(monitor.run(cancel.child_token())),
            tokio::spawn(reaper.run(cancel.child_token())),
        ]
    }

    /// Close every connection with 1001 and release all topics.
    pub fn close_all(&self) -> usize {
        let closed = self.registry.drain(CloseReason::ShuttingDown);
        info!(closed, "closed all connections");
        closed
    }
}
