//! # relay-server
//!
//! Real-time event distribution for long-running executions.
//!
//! - Topic registry: which connections observe which execution, user,
//!   workspace or global topic, plus a bounded replay buffer per topic
//! - Broadcaster: ordered per-topic fan-out with bounded send timeouts and
//!   eviction of failing connections
//! - Liveness monitor and topic reaper background loops
//! - [`RealtimeHub`]: the facade used by socket handlers and event producers
//! - Axum `WebSocket` gateway with 4001/4003 handshake rejection, plus
//!   health, stats and Prometheus endpoints
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod websocket;

pub use auth::{
    AllowAll, Authenticator, EntitlementChecker, Identity, JwtAuthenticator,
    OwnershipEntitlements, StaticAuthenticator,
};
pub use config::{RealtimeConfig, ServerConfig};
pub use errors::{AuthError, DeliveryError, RegistryError, ServerError, SubscribeError};
pub use hub::RealtimeHub;
pub use server::{RelayServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
pub use status::{StatusProvider, StatusTable};
pub use websocket::broadcast::PublishReport;
pub use websocket::connection::{CloseReason, Connection};
pub use websocket::registry::{GlobalStats, TopicRegistry, TopicStats};
