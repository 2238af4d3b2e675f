//! Client-originated control messages.
//!
//! Clients may send `{"type": "heartbeat"}`, `{"type": "heartbeat_ack"}` and,
//! on execution topics, `{"type": "request_status"}`. Anything else is
//! answered with an `error` frame and the connection stays open.

use relay_core::{Event, EventKind, into_payload};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::connection::Connection;
use crate::hub::RealtimeHub;

/// Build an `error` event carrying `message`.
pub fn error_event(message: impl Into<String>) -> Event {
    Event::new(EventKind::Error).with_payload(into_payload(json!({ "message": message.into() })))
}

/// Handle one inbound text frame and return the reply, if any.
#[instrument(skip_all, fields(conn_id = %conn.id(), msg_type))]
pub async fn handle_message(text: &str, conn: &Connection, hub: &RealtimeHub) -> Option<Event> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "invalid JSON received");
            return Some(error_event(format!("Invalid JSON: {e}")));
        }
    };

    let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
        warn!("message without type");
        return Some(error_event("Missing message type"));
    };
    let _ = tracing::Span::current().record("msg_type", msg_type);

    match msg_type {
        "heartbeat" => {
            conn.mark_alive();
            Some(Event::new(EventKind::HeartbeatAck))
        }
        "heartbeat_ack" | "pong" => {
            conn.mark_alive();
            None
        }
        "request_status" => match conn.topic().filter(|t| t.is_execution_scoped()) {
            Some(topic) => {
                debug!(%topic, "status requested");
                Some(hub.status_snapshot(topic).await)
            }
            None => Some(error_event(
                "request_status is only supported on execution topics",
            )),
        },
        other => {
            warn!(msg_type = other, "unsupported message type");
            Some(error_event(format!("Unsupported message type: {other}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::test_support::connection;
    use super::*;
    use crate::auth::{AllowAll, StaticAuthenticator};
    use crate::config::RealtimeConfig;
    use relay_core::{ExecutionId, PrincipalId, TopicKind};
    use std::sync::Arc;
    use std::time::Duration;

    fn hub() -> RealtimeHub {
        RealtimeHub::new(
            RealtimeConfig::default(),
            Arc::new(StaticAuthenticator::new()),
            Arc::new(AllowAll),
        )
    }

    #[tokio::test]
    async fn heartbeat_gets_ack() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 8);
        let reply = handle_message(r#"{"type":"heartbeat"}"#, &conn, &hub).await.unwrap();
        assert_eq!(reply.kind(), EventKind::HeartbeatAck);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ack_marks_alive_silently() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 8);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(handle_message(r#"{"type":"heartbeat_ack"}"#, &conn, &hub).await.is_none());
        assert!(conn.last_liveness_elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn invalid_json_is_error_frame() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 8);
        let reply = handle_message("not json{", &conn, &hub).await.unwrap();
        assert_eq!(reply.kind(), EventKind::Error);
        let message = reply.payload()["message"].as_str().unwrap();
        assert!(message.starts_with("Invalid JSON"));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn unknown_type_is_named() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 8);
        let reply = handle_message(r#"{"type":"subscribe_all"}"#, &conn, &hub).await.unwrap();
        assert_eq!(reply.payload()["message"], "Unsupported message type: subscribe_all");
    }

    #[tokio::test]
    async fn missing_type_is_error() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 8);
        let reply = handle_message(r#"{"kind":"heartbeat"}"#, &conn, &hub).await.unwrap();
        assert_eq!(reply.payload()["message"], "Missing message type");
        let reply = handle_message("[1,2]", &conn, &hub).await.unwrap();
        assert_eq!(reply.kind(), EventKind::Error);
    }

    #[tokio::test]
    async fn request_status_on_execution_topic() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 64);
        let _ = hub.subscribe(TopicKind::Execution, Some("E1"), &conn).await.unwrap();
        let _ = hub
            .execution_completed(&ExecutionId::from("E1"), PrincipalId::new(1), json!({}))
            .await;

        let reply = handle_message(r#"{"type":"request_status"}"#, &conn, &hub).await.unwrap();
        assert_eq!(reply.kind(), EventKind::StatusUpdate);
        assert_eq!(reply.payload()["status"], "completed");
        assert_eq!(reply.payload()["subscriber_count"], 1);
        assert_eq!(reply.to_frame().execution_id, Some(ExecutionId::from("E1")));
    }

    #[tokio::test]
    async fn request_status_off_execution_topic() {
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 64);
        let _ = hub.subscribe(TopicKind::User, Some("1"), &conn).await.unwrap();
        let reply = handle_message(r#"{"type":"request_status"}"#, &conn, &hub).await.unwrap();
        assert_eq!(reply.kind(), EventKind::Error);
    }
}
