//! Events and their wire representation.
//!
//! An [`Event`] is an immutable record of one thing that happened: a
//! lifecycle transition of an execution or step, an informational message,
//! or a control message addressed to a single connection. Events are built
//! with the consuming `with_*` methods and are never mutated afterwards;
//! the relay shares them as `Arc<Event>`.
//!
//! Server-to-client frames have the shape
//! `{"event_type", "data", "timestamp", "event_id", "execution_id",
//! "node_id", "user_id"}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, ExecutionId, PrincipalId, StepId};
use crate::topic::TopicId;

/// Open key-value payload carried by an event.
pub type Payload = serde_json::Map<String, Value>;

/// Coerce an arbitrary JSON value into a payload map.
///
/// Objects are used as-is, `null` becomes an empty map, and any other value
/// is wrapped as `{"value": ...}`.
pub fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            let _ = map.insert("value".into(), other);
            map
        }
    }
}

/// Coarse grouping of [`EventKind`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventCategory {
    /// Execution lifecycle.
    Lifecycle,
    /// Step lifecycle.
    Step,
    /// Logs, metrics, warnings, errors.
    Informational,
    /// Connection-level control traffic.
    Control,
}

/// Enumerated event tag, serialized as `event_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Execution began running.
    ExecutionStarted,
    /// Execution reported progress.
    ExecutionProgress,
    /// Execution finished successfully.
    ExecutionCompleted,
    /// Execution failed.
    ExecutionFailed,
    /// Execution was cancelled.
    ExecutionCancelled,
    /// Step began running.
    StepStarted,
    /// Step reported progress.
    StepProgress,
    /// Step finished successfully.
    StepCompleted,
    /// Step failed.
    StepFailed,
    /// Step was skipped.
    StepSkipped,
    /// Log line.
    LogMessage,
    /// Performance metrics sample.
    PerformanceMetric,
    /// Non-fatal warning.
    Warning,
    /// Error report, also used to answer malformed client frames.
    Error,
    /// Liveness probe.
    Heartbeat,
    /// Answer to a client heartbeat.
    HeartbeatAck,
    /// Answer to a client `request_status`.
    StatusUpdate,
    /// Connection state notice sent right after joining.
    ConnectionStatus,
    /// Join accepted.
    SubscriptionConfirmed,
    /// Join refused.
    SubscriptionFailed,
}

impl EventKind {
    /// Wire name of this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionProgress => "execution_progress",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::StepStarted => "step_started",
            Self::StepProgress => "step_progress",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::LogMessage => "log_message",
            Self::PerformanceMetric => "performance_metric",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::StatusUpdate => "status_update",
            Self::ConnectionStatus => "connection_status",
            Self::SubscriptionConfirmed => "subscription_confirmed",
            Self::SubscriptionFailed => "subscription_failed",
        }
    }

    /// Category this kind belongs to.
    pub const fn category(self) -> EventCategory {
        match self {
            Self::ExecutionStarted
            | Self::ExecutionProgress
            | Self::ExecutionCompleted
            | Self::ExecutionFailed
            | Self::ExecutionCancelled => EventCategory::Lifecycle,
            Self::StepStarted
            | Self::StepProgress
            | Self::StepCompleted
            | Self::StepFailed
            | Self::StepSkipped => EventCategory::Step,
            Self::LogMessage | Self::PerformanceMetric | Self::Warning | Self::Error => {
                EventCategory::Informational
            }
            Self::Heartbeat
            | Self::HeartbeatAck
            | Self::StatusUpdate
            | Self::ConnectionStatus
            | Self::SubscriptionConfirmed
            | Self::SubscriptionFailed => EventCategory::Control,
        }
    }

    /// Execution status implied by a lifecycle kind.
    pub const fn execution_status(self) -> Option<&'static str> {
        match self {
            Self::ExecutionStarted | Self::ExecutionProgress => Some("running"),
            Self::ExecutionCompleted => Some("completed"),
            Self::ExecutionFailed => Some("failed"),
            Self::ExecutionCancelled => Some("cancelled"),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable event.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Payload,
    event_id: EventId,
    topic_id: Option<TopicId>,
    step_id: Option<StepId>,
    principal_id: Option<PrincipalId>,
    created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event of `kind` with an empty payload and a fresh ID.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            payload: Payload::new(),
            event_id: EventId::new(),
            topic_id: None,
            step_id: None,
            principal_id: None,
            created_at: Utc::now(),
        }
    }

    /// Replace the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Attach the topic this event belongs to.
    #[must_use]
    pub fn with_topic(mut self, topic: TopicId) -> Self {
        self.topic_id = Some(topic);
        self
    }

    /// Attach a step identifier.
    #[must_use]
    pub fn with_step(mut self, step: StepId) -> Self {
        self.step_id = Some(step);
        self
    }

    /// Attach the principal the event concerns.
    #[must_use]
    pub fn with_principal(mut self, principal: PrincipalId) -> Self {
        self.principal_id = Some(principal);
        self
    }

    /// Event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Kind-specific payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Unique event ID.
    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    /// Owning topic, `None` for control events sent to a single connection.
    pub fn topic_id(&self) -> Option<&TopicId> {
        self.topic_id.as_ref()
    }

    /// Step the event concerns.
    pub fn step_id(&self) -> Option<&StepId> {
        self.step_id.as_ref()
    }

    /// Principal the event concerns.
    pub fn principal_id(&self) -> Option<PrincipalId> {
        self.principal_id
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Borrowed wire frame for this event.
    pub fn to_frame(&self) -> EventFrame<'_> {
        EventFrame {
            event_type: self.kind,
            data: &self.payload,
            timestamp: self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            event_id: &self.event_id,
            execution_id: self.topic_id.as_ref().and_then(TopicId::execution_id),
            node_id: self.step_id.as_ref(),
            user_id: self.principal_id,
        }
    }

    /// Serialize the wire frame to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_frame())
    }
}

/// Server-to-client JSON frame.
#[derive(Debug, Serialize)]
pub struct EventFrame<'a> {
    /// Event kind.
    pub event_type: EventKind,
    /// Payload.
    pub data: &'a Payload,
    /// ISO-8601 creation time with millisecond precision.
    pub timestamp: String,
    /// Event ID.
    pub event_id: &'a EventId,
    /// Execution the event belongs to, if any.
    pub execution_id: Option<ExecutionId>,
    /// Step the event concerns, if any.
    pub node_id: Option<&'a StepId>,
    /// Principal the event concerns, if any.
    pub user_id: Option<PrincipalId>,
}
