use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::record::StateExecutionRecord;
use crate::error::{EngineError, EngineResult};
use crate::statelang::StateMachine;

/// Overall status of an instance. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    /// Every executed state completed normally
    Succeeded,
    /// A state failed but no durable effect was left uncompensated
    Failed,
    /// A durable effect may be out of sync with the saga's outcome
    Inconsistent,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Running => f.write_str("RU"),
            ExecutionStatus::Succeeded => f.write_str("SU"),
            ExecutionStatus::Failed => f.write_str("FA"),
            ExecutionStatus::Inconsistent => f.write_str("UN"),
        }
    }
}

/// One execution of a state machine definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineInstance {
    pub id: String,
    pub machine_name: String,
    pub business_key: Option<String>,
    pub current_state: String,
    pub status: ExecutionStatus,
    pub compensation_status: Option<ExecutionStatus>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Variables captured when the traversal last suspended
    pub context_snapshot: Value,
    records: Vec<StateExecutionRecord>,
    /// Resolved once per traversal start, never persisted
    #[serde(skip)]
    definition: Option<Arc<StateMachine>>,
}

impl StateMachineInstance {
    pub fn new(machine_name: &str, business_key: Option<String>, start_state: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            machine_name: machine_name.to_string(),
            business_key,
            current_state: start_state.to_string(),
            status: ExecutionStatus::Running,
            compensation_status: None,
            started_at: Utc::now(),
            ended_at: None,
            context_snapshot: Value::Object(Default::default()),
            records: Vec::new(),
            definition: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Single authoritative terminal write. A second write is a logic error.
    pub fn set_terminal_status(&mut self, status: ExecutionStatus) -> EngineResult<()> {
        if self.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "instance {} already finished with status {}",
                self.id, self.status
            )));
        }
        if !status.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "status {} is not terminal",
                status
            )));
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Append a record, assigning the next sequence number
    pub fn append_record(&mut self, mut record: StateExecutionRecord) -> &StateExecutionRecord {
        record.seq = self.records.last().map_or(1, |last| last.seq + 1);
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[StateExecutionRecord] {
        &self.records
    }

    pub fn last_record(&self) -> Option<&StateExecutionRecord> {
        self.records.last()
    }

    /// Latest forward record for a state within a branch
    pub fn latest_forward_record(
        &self,
        state_name: &str,
        branch_id: Option<&str>,
    ) -> Option<&StateExecutionRecord> {
        self.records.iter().rev().find(|r| {
            r.is_forward() && r.state_name == state_name && r.branch_id.as_deref() == branch_id
        })
    }

    /// Number of consecutive failed forward attempts of a state, counted
    /// backwards from the newest record of that state
    pub fn consecutive_failures(&self, state_name: &str, branch_id: Option<&str>) -> u32 {
        self.records
            .iter()
            .rev()
            .filter(|r| {
                r.is_forward()
                    && r.state_name == state_name
                    && r.branch_id.as_deref() == branch_id
            })
            .take_while(|r| r.status == super::RecordStatus::Failed)
            .count() as u32
    }

    pub fn attach_definition(&mut self, definition: Arc<StateMachine>) {
        self.definition = Some(definition);
    }

    pub fn definition(&self) -> Option<&Arc<StateMachine>> {
        self.definition.as_ref()
    }
}
