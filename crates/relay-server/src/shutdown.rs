//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hub::RealtimeHub;

/// Default timeout for graceful shutdown before giving up on tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinates graceful shutdown across the server and background loops.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop background work, then close every remaining connection.
    ///
    /// 1. Cancel the token (liveness monitor, reaper and HTTP server exit)
    /// 2. Wait up to `timeout` for `handles` to complete
    /// 3. Close all connections with 1001 and release registry state
    pub async fn graceful_shutdown(
        &self,
        hub: &RealtimeHub,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> usize {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
        hub.close_all()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_core::{PrincipalId, TopicKind};

    use crate::auth::{AllowAll, StaticAuthenticator};
    use crate::config::RealtimeConfig;
    use crate::websocket::connection::CloseReason;
    use crate::websocket::connection::test_support::connection;

    fn hub() -> RealtimeHub {
        RealtimeHub::new(
            RealtimeConfig::default(),
            Arc::new(StaticAuthenticator::new()),
            Arc::new(AllowAll),
        )
    }

    #[test]
    fn initial_state_not_shutting_down() {
        let coord = ShutdownCoordinator::new();
        assert!(!coord.is_shutting_down());
    }

    #[test]
    fn multiple_shutdown_calls_idempotent() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_background_and_closes_connections() {
        let coord = ShutdownCoordinator::new();
        let hub = hub();
        let (conn, _rx) = connection("c", 1, 64);
        let _ = hub
            .subscribe(TopicKind::User, Some(&PrincipalId::new(1).to_string()), &conn)
            .await
            .unwrap();
        let handles = hub.spawn_background(&coord.token());

        let closed = coord.graceful_shutdown(&hub, handles, None).await;
        assert_eq!(closed, 1);
        assert_eq!(conn.close_reason(), Some(CloseReason::ShuttingDown));
        assert_eq!(hub.global_stats().active_topics, 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_times_out() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });
        let _ = coord
            .graceful_shutdown(&hub(), vec![handle], Some(Duration::from_millis(100)))
            .await;
        assert!(coord.is_shutting_down());
    }
}
