//! Execution status lookups for `request_status`.

use async_trait::async_trait;
use dashmap::DashMap;
use relay_core::{ExecutionId, Payload};

/// Source of authoritative execution status, usually the execution engine.
#[async_trait]
pub trait StatusProvider: Send + Sync {
    /// Current status payload for `execution`, or `None` if unknown.
    async fn execution_status(&self, execution: &ExecutionId) -> Option<Payload>;
}

/// In-memory status table the execution engine writes into.
#[derive(Default)]
pub struct StatusTable {
    entries: DashMap<ExecutionId, Payload>,
}

impl StatusTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the status payload for an execution.
    pub fn set(&self, execution: ExecutionId, status: Payload) {
        let _ = self.entries.insert(execution, status);
    }

    /// Drop an execution's entry.
    pub fn remove(&self, execution: &ExecutionId) {
        let _ = self.entries.remove(execution);
    }
}

#[async_trait]
impl StatusProvider for StatusTable {
    async fn execution_status(&self, execution: &ExecutionId) -> Option<Payload> {
        self.entries.get(execution).map(|entry| entry.value().clone())
    }
}
