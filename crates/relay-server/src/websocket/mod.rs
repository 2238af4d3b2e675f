//! Topic registry, connections, fan-out, liveness, reaping and the
//! WebSocket session loop.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod reaper;
pub mod registry;
pub mod session;
