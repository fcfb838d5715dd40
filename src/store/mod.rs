// Instance persistence boundary
//
// The engine talks to durable storage only through `InstanceRepository`.
// The terminal-status invariant is enforced by its compare-and-swap, since
// several engine processes may race on one instance during failover.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::domain::{ExecutionStatus, StateExecutionRecord, StateMachineInstance};

pub use memory::InMemoryInstanceRepository;

/// Errors that can occur during instance persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Instance {0} already exists")]
    AlreadyExists(String),

    #[error("Instance {0} not found")]
    NotFound(String),

    #[error("Record out of order for instance {instance_id}: expected seq {expected}, found {found}")]
    OutOfOrder {
        instance_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Instance {0} is terminal and no longer accepts records")]
    Closed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Fields written together with a terminal status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalUpdate {
    pub status: ExecutionStatus,
    pub compensation_status: Option<ExecutionStatus>,
    pub current_state: String,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TerminalUpdate {
    pub fn from_instance(instance: &StateMachineInstance) -> Self {
        Self {
            status: instance.status,
            compensation_status: instance.compensation_status,
            current_state: instance.current_state.clone(),
            ended_at: instance.ended_at,
        }
    }
}

/// Transactional repository keyed by instance id
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: &StateMachineInstance) -> Result<(), PersistenceError>;

    /// Append one record; `record.seq` must directly follow the last stored one
    async fn append_record(
        &self,
        instance_id: &str,
        record: &StateExecutionRecord,
    ) -> Result<(), PersistenceError>;

    async fn load(&self, instance_id: &str) -> Result<Option<StateMachineInstance>, PersistenceError>;

    /// Persist the cursor and variable snapshot of a suspended or running traversal
    async fn save_progress(
        &self,
        instance_id: &str,
        current_state: &str,
        context_snapshot: &Value,
    ) -> Result<(), PersistenceError>;

    /// Apply `update` only if the stored status still equals `expected`.
    /// Returns false when another writer got there first.
    async fn compare_and_swap_status(
        &self,
        instance_id: &str,
        expected: ExecutionStatus,
        update: &TerminalUpdate,
    ) -> Result<bool, PersistenceError>;
}
