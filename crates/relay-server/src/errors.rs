//! Error types for the relay server.
//!
//! Only handshake and registry errors ever reach a caller. Delivery failures
//! are absorbed by the broadcaster and turned into evictions.

use relay_core::constants::close_code;
use relay_core::{ConnectionId, ParseTopicError, PrincipalId, TopicId};
use thiserror::Error;

/// Topic registry invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection is already registered under a topic.
    #[error("connection {connection_id} is already joined to {topic}")]
    AlreadyJoined {
        /// Offending connection.
        connection_id: ConnectionId,
        /// Topic it is already registered under.
        topic: TopicId,
    },
}

/// Credential validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer credential was supplied.
    #[error("missing credential")]
    MissingCredential,
    /// The credential could not be validated.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    /// The credential was valid once but has expired.
    #[error("credential expired")]
    Expired,
}

impl AuthError {
    /// Close code sent to the client when the handshake fails.
    pub const fn close_code(&self) -> u16 {
        close_code::UNAUTHENTICATED
    }
}

/// Reasons a subscribe call is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// Kind/scope pair does not form a valid topic.
    #[error("invalid scope: {0}")]
    InvalidScope(#[from] ParseTopicError),
    /// Principal may not observe this topic.
    #[error("principal {principal} is not entitled to {topic}")]
    NotEntitled {
        /// Requesting principal.
        principal: PrincipalId,
        /// Requested topic.
        topic: TopicId,
    },
    /// Registry rejected the join.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// The connection's queue could not take the join preamble.
    #[error("connection closed during join")]
    ConnectionClosed,
}

impl SubscribeError {
    /// Close code sent to the client when the subscription fails.
    pub const fn close_code(&self) -> u16 {
        match self {
            Self::NotEntitled { .. } => close_code::FORBIDDEN,
            Self::InvalidScope(_) => close_code::POLICY_VIOLATION,
            Self::Registry(_) | Self::ConnectionClosed => close_code::INTERNAL_ERROR,
        }
    }
}

/// A single send to a single connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Transport already closed.
    #[error("connection closed")]
    Closed,
    /// Send did not complete within the bound.
    #[error("send timed out")]
    TimedOut,
    /// Outbound queue is full.
    #[error("send queue full")]
    QueueFull,
}

/// Server startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
