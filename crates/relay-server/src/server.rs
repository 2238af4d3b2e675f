//! `RelayServer`: Axum HTTP + WebSocket server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{ConnectionId, TopicId, TopicKind};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::hub::RealtimeHub;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::{GlobalStats, TopicStats};
use crate::websocket::session::{Handshake, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session facade.
    pub hub: Arc<RealtimeHub>,
    /// When the server started.
    pub start_time: Instant,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Body of `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Registry-wide counters.
    #[serde(flatten)]
    pub global: GlobalStats,
    /// Per-topic counters.
    pub topics: Vec<TopicStats>,
}

/// Running server: bound address plus the tasks to await on shutdown.
pub struct ServerHandle {
    /// Address the listener is bound to.
    pub addr: SocketAddr,
    /// HTTP server task and background loops.
    pub tasks: Vec<JoinHandle<()>>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    hub: Arc<RealtimeHub>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a new server around `hub`.
    pub fn new(config: ServerConfig, hub: Arc<RealtimeHub>) -> Self {
        Self {
            config,
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            start_time: self.start_time,
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/stats/topics/{topic}", get(topic_stats_handler))
            .route("/ws/executions/{execution_id}", get(execution_ws))
            .route("/ws/workspaces/{workspace_id}", get(workspace_ws))
            .route("/ws/user", get(user_ws))
            .route("/ws/global", get(global_ws))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, serve, and start the liveness monitor and topic reaper.
    pub async fn start(&self) -> Result<ServerHandle, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });

        let mut tasks = vec![server];
        tasks.extend(self.hub.spawn_background(&self.shutdown.token()));
        info!(addr = %local_addr, "relay server listening");
        Ok(ServerHandle {
            addr: local_addr,
            tasks,
        })
    }

    /// Session facade.
    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

// ── HTTP handlers ───────────────────────────────────────────────────────────

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.global_stats();
    Json(health::health_check(
        state.start_time,
        stats.total_connections,
        stats.active_topics,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        global: state.hub.global_stats(),
        topics: state.hub.registry().all_stats(),
    })
}

/// GET /stats/topics/{topic}
async fn topic_stats_handler(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Response {
    let Ok(topic) = topic.parse::<TopicId>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.hub.stats(&topic) {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── WebSocket upgrades ──────────────────────────────────────────────────────

type Params = Query<HashMap<String, String>>;

/// GET /ws/executions/{execution_id}
async fn execution_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, &state, TopicKind::Execution, Some(execution_id), &params, &headers)
}

/// GET /ws/workspaces/{workspace_id}
async fn workspace_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, &state, TopicKind::Workspace, Some(workspace_id), &params, &headers)
}

/// GET /ws/user
async fn user_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, &state, TopicKind::User, None, &params, &headers)
}

/// GET /ws/global
async fn global_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Params,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, &state, TopicKind::Global, None, &params, &headers)
}

/// Upgrade first and authenticate afterwards, so handshake failures can be
/// reported with WebSocket close codes.
fn upgrade(
    ws: WebSocketUpgrade,
    state: &AppState,
    kind: TopicKind,
    scope: Option<String>,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Response {
    let handshake = Handshake {
        kind,
        scope,
        credential: bearer_credential(headers, params),
        metadata: client_metadata(headers, params),
    };
    let hub = Arc::clone(&state.hub);
    let conn_id = ConnectionId::new();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, conn_id, hub, handshake))
}

// ── Pure request parsing ────────────────────────────────────────────────────

/// Credential from `Authorization: Bearer <token>`, falling back to `?token=`.
pub fn bearer_credential(headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    from_header
        .map(str::to_owned)
        .or_else(|| params.get("token").filter(|t| !t.is_empty()).cloned())
}

/// Client annotations from the `User-Agent` header and `?client=`.
pub fn client_metadata(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    if let Some(agent) = headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
        let _ = metadata.insert("user_agent".to_owned(), agent.to_owned());
    }
    if let Some(client) = params.get("client") {
        let _ = metadata.insert("client".to_owned(), client.clone());
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use relay_core::{ExecutionId, PrincipalId};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::auth::{AllowAll, StaticAuthenticator};
    use crate::config::RealtimeConfig;

    fn make_server() -> RelayServer {
        let hub = RealtimeHub::new(
            RealtimeConfig::default(),
            Arc::new(StaticAuthenticator::new()),
            Arc::new(AllowAll),
        );
        RelayServer::new(ServerConfig::default(), Arc::new(hub))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert!(!server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn stats_endpoint_lists_topics() {
        let server = make_server();
        let _ = server
            .hub()
            .execution_started(&ExecutionId::from("E1"), PrincipalId::new(1), json!({}))
            .await;
        let (status, body) = get_json(server.router(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        // execution topic plus the global topic it forwards to
        assert_eq!(body["active_topics"], 2);
        assert_eq!(body["total_connections"], 0);
        assert_eq!(body["topics"][0]["topic"], "execution:E1");
    }

    #[tokio::test]
    async fn topic_stats_endpoint() {
        let server = make_server();
        let _ = server
            .hub()
            .execution_started(&ExecutionId::from("E1"), PrincipalId::new(1), json!({}))
            .await;

        let (status, body) = get_json(server.router(), "/stats/topics/execution:E1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["history_length"], 1);
        assert_eq!(body["subscriber_count"], 0);

        let (status, _) = get_json(server.router(), "/stats/topics/execution:nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(server.router(), "/stats/topics/bogus:x").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn topic_stats_for_scope_with_separator() {
        let server = make_server();
        let _ = server
            .hub()
            .execution_started(&ExecutionId::from("run:42"), PrincipalId::new(1), json!({}))
            .await;

        let (status, body) = get_json(server.router(), "/stats/topics/execution:run:42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topic"], "execution:run:42");
        assert_eq!(body["history_length"], 1);

        let (_, all) = get_json(server.router(), "/stats").await;
        let listed: TopicId = serde_json::from_value(all["topics"][0]["topic"].clone()).unwrap();
        assert_eq!(listed, TopicId::execution(&ExecutionId::from("run:42")));
    }

    #[tokio::test]
    async fn metrics_absent_without_recorder() {
        let server = make_server();
        let (status, _) = get_json(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_json(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn credential_from_header_then_query() {
        let mut headers = HeaderMap::new();
        let mut params = HashMap::new();
        assert_eq!(bearer_credential(&headers, &params), None);

        let _ = params.insert("token".to_owned(), "from-query".to_owned());
        assert_eq!(bearer_credential(&headers, &params).as_deref(), Some("from-query"));

        let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(bearer_credential(&headers, &params).as_deref(), Some("from-header"));

        let _ = headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_credential(&headers, &params).as_deref(), Some("from-query"));
    }

    #[test]
    fn metadata_collects_agent_and_client() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(USER_AGENT, HeaderValue::from_static("test-agent/1.0"));
        let params = HashMap::from([("client".to_owned(), "dashboard".to_owned())]);
        let metadata = client_metadata(&headers, &params);
        assert_eq!(metadata["user_agent"], "test-agent/1.0");
        assert_eq!(metadata["client"], "dashboard");
    }
}
