//! WebSocket session lifecycle: handles a single client from upgrade
//! through disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::{ConnectionId, TopicKind};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{CloseReason, Connection, Outbound};
use super::handler::{error_event, handle_message};
use crate::hub::RealtimeHub;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTION_DURATION_SECONDS, HANDSHAKE_REJECTIONS_TOTAL};

/// How long the writer gets to flush the close frame after the connection
/// is closed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the client asked for when it opened the socket.
#[derive(Clone, Debug)]
pub struct Handshake {
    /// Requested topic kind.
    pub kind: TopicKind,
    /// Requested scope. `None` on a user topic means the caller's own.
    pub scope: Option<String>,
    /// Bearer credential.
    pub credential: Option<String>,
    /// Client annotations (user agent, client name).
    pub metadata: HashMap<String, String>,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Authenticates the credential; failure closes with 4001
/// 2. Subscribes to the requested topic; refusal closes with the
///    subscription error's code (4003 for entitlement)
/// 3. Forwards outbound frames and probes via the writer task
/// 4. Dispatches inbound control messages
/// 5. Leaves the topic on disconnect
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    conn_id: ConnectionId,
    hub: Arc<RealtimeHub>,
    handshake: Handshake,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let identity = match hub.authenticate(handshake.credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "handshake authentication failed");
            counter!(HANDSHAKE_REJECTIONS_TOTAL, "code" => e.close_code().to_string()).increment(1);
            send_close(&mut ws_tx, e.close_code(), "unauthenticated").await;
            return;
        }
    };

    let (send_tx, send_rx) = mpsc::channel::<Outbound>(hub.config().send_queue_capacity);
    let connection = Arc::new(
        Connection::new(conn_id.clone(), identity, send_tx).with_metadata(handshake.metadata),
    );
    let writer = tokio::spawn(write_loop(ws_tx, send_rx, Arc::clone(&connection)));

    let kind = handshake.kind;
    let scope = match (kind, handshake.scope) {
        (TopicKind::User, None) => Some(identity.principal_id.to_string()),
        (_, scope) => scope,
    };

    if let Err(e) = hub.subscribe(kind, scope.as_deref(), &connection).await {
        warn!(error = %e, code = e.close_code(), "subscription refused");
        counter!(HANDSHAKE_REJECTIONS_TOTAL, "code" => e.close_code().to_string()).increment(1);
        let _ = connection.close(CloseReason::Refused(e.close_code()));
        finish_writer(writer).await;
        return;
    }

    info!(principal = %identity.principal_id, topic = ?connection.topic(), "client connected");
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);

    loop {
        tokio::select! {
            () = connection.closed() => {
                debug!(reason = ?connection.close_reason(), "connection closed by server");
                break;
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(s) = std::str::from_utf8(&data) {
                            s.to_owned()
                        } else {
                            let _ = hub
                                .broadcaster()
                                .send_to(&connection, &error_event("Binary frames must be UTF-8 JSON"))
                                .await;
                            continue;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        connection.mark_alive();
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        info!("client sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    None => break,
                };

                if let Some(reply) = handle_message(&text, &connection, &hub).await {
                    let _ = hub.broadcaster().send_to(&connection, &reply).await;
                }
            }
        }
    }

    let _ = hub.unsubscribe(&connection);
    let _ = connection.close(CloseReason::Normal);
    info!(reason = ?connection.close_reason(), "client disconnected");
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    finish_writer(writer).await;
}

/// Forward queued frames to the socket until the connection closes.
///
/// Probes are written as the heartbeat text frame followed by a Ping.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    conn: Arc<Connection>,
) {
    loop {
        tokio::select! {
            biased;
            () = conn.closed() => {
                let reason = conn.close_reason().unwrap_or(CloseReason::Normal);
                send_close(&mut ws_tx, reason.code(), reason.as_str()).await;
                break;
            }
            item = rx.recv() => {
                let ok = match item {
                    Some(Outbound::Frame(text)) => {
                        ws_tx.send(Message::Text(text.as_str().into())).await.is_ok()
                    }
                    Some(Outbound::Probe(text)) => {
                        ws_tx.send(Message::Text(text.as_str().into())).await.is_ok()
                            && ws_tx.send(Message::Ping(Vec::new().into())).await.is_ok()
                    }
                    None => false,
                };
                if !ok {
                    debug!(conn_id = %conn.id(), "socket write failed, stopping writer");
                    let _ = conn.close(CloseReason::SendFailed);
                    break;
                }
            }
        }
    }
}

async fn send_close(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.close().await;
}

async fn finish_writer(writer: tokio::task::JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("writer did not finish in time, aborting");
        abort.abort();
    }
}
