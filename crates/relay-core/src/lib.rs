//! # relay-core
//!
//! Shared vocabulary for the relay event-distribution layer.
//!
//! - **Branded IDs**: `ConnectionId`, `EventId`, `ExecutionId`, `StepId`,
//!   `WorkspaceId` newtypes, plus the integer `PrincipalId`
//! - **Topics**: `TopicId` keyed by `TopicKind` (execution/user/workspace/global)
//! - **Events**: immutable `Event` values, `EventKind` tags and the JSON wire frame
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;
pub mod topic;

pub use errors::ParseTopicError;
pub use events::{Event, EventCategory, EventFrame, EventKind, Payload, into_payload};
pub use ids::{ConnectionId, EventId, ExecutionId, PrincipalId, StepId, WorkspaceId};
pub use topic::{TopicId, TopicKind};
