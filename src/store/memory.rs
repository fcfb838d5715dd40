use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{InstanceRepository, PersistenceError, TerminalUpdate};
use crate::domain::{ExecutionStatus, StateExecutionRecord, StateMachineInstance};

/// Reference repository keeping instances in process memory
#[derive(Debug, Default)]
pub struct InMemoryInstanceRepository {
    instances: RwLock<HashMap<String, StateMachineInstance>>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn create(&self, instance: &StateMachineInstance) -> Result<(), PersistenceError> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(PersistenceError::AlreadyExists(instance.id.clone()));
        }
        instances.insert(instance.id.clone(), instance.clone());
        debug!(instance_id = %instance.id, "Created instance");
        Ok(())
    }

    async fn append_record(
        &self,
        instance_id: &str,
        record: &StateExecutionRecord,
    ) -> Result<(), PersistenceError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(instance_id)
            .ok_or_else(|| PersistenceError::NotFound(instance_id.to_string()))?;

        if stored.is_terminal() {
            return Err(PersistenceError::Closed(instance_id.to_string()));
        }
        let expected = stored.last_record().map_or(1, |last| last.seq + 1);
        if record.seq != expected {
            return Err(PersistenceError::OutOfOrder {
                instance_id: instance_id.to_string(),
                expected,
                found: record.seq,
            });
        }
        stored.append_record(record.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<StateMachineInstance>, PersistenceError> {
        Ok(self.instances.read().await.get(instance_id).cloned())
    }

    async fn save_progress(
        &self,
        instance_id: &str,
        current_state: &str,
        context_snapshot: &Value,
    ) -> Result<(), PersistenceError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(instance_id)
            .ok_or_else(|| PersistenceError::NotFound(instance_id.to_string()))?;
        stored.current_state = current_state.to_string();
        stored.context_snapshot = context_snapshot.clone();
        Ok(())
    }

    async fn compare_and_swap_status(
        &self,
        instance_id: &str,
        expected: ExecutionStatus,
        update: &TerminalUpdate,
    ) -> Result<bool, PersistenceError> {
        let mut instances = self.instances.write().await;
        let stored = instances
            .get_mut(instance_id)
            .ok_or_else(|| PersistenceError::NotFound(instance_id.to_string()))?;

        if stored.status != expected {
            debug!(
                instance_id = %instance_id,
                expected = %expected,
                actual = %stored.status,
                "Status compare-and-swap lost"
            );
            return Ok(false);
        }
        stored.status = update.status;
        stored.compensation_status = update.compensation_status;
        stored.current_state = update.current_state.clone();
        stored.ended_at = update.ended_at;
        Ok(true)
    }
}
