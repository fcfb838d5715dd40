use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FailureKind, StateFailure};

/// Outcome of one executed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Succeeded,
    Failed,
    Skipped,
    /// Invocation dispatched but not confirmed (awaiting an async callback)
    Unknown,
}

/// Whether a record belongs to forward or backward execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
    Forward,
    Compensation {
        /// Forward state whose effect this record undoes
        compensated_state: String,
    },
}

/// Kind + message of a failure, as persisted with the record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub kind: FailureKind,
    pub code: String,
    pub message: String,
}

impl From<&StateFailure> for FailureSummary {
    fn from(failure: &StateFailure) -> Self {
        Self {
            kind: failure.kind,
            code: failure.code.clone(),
            message: failure.message.clone(),
        }
    }
}

impl FailureSummary {
    /// Rebuild the failure this summary was taken from
    pub fn to_failure(&self, state_name: &str) -> StateFailure {
        StateFailure {
            kind: self.kind,
            code: self.code.clone(),
            message: self.message.clone(),
            state_name: Some(state_name.to_string()),
        }
    }
}

/// One executed state within an instance. Records are append-only and their
/// `seq` order is the causal order of the instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateExecutionRecord {
    /// Assigned on append, strictly increasing per instance
    pub seq: u64,
    pub state_name: String,
    /// Set for records produced inside a parallel branch
    pub branch_id: Option<String>,
    pub kind: RecordKind,
    pub input: Value,
    pub output: Option<Value>,
    pub status: RecordStatus,
    pub failure: Option<FailureSummary>,
    /// True if the state mutates durable participant data
    pub is_for_update: bool,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StateExecutionRecord {
    /// A forward record whose outcome is not yet known
    pub fn forward(state_name: &str, input: Value, is_for_update: bool, attempt: u32) -> Self {
        Self {
            seq: 0,
            state_name: state_name.to_string(),
            branch_id: None,
            kind: RecordKind::Forward,
            input,
            output: None,
            status: RecordStatus::Unknown,
            failure: None,
            is_for_update,
            attempt,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// A compensation record executed by `state_name` on behalf of `compensated_state`
    pub fn compensation(state_name: &str, compensated_state: &str, input: Value) -> Self {
        Self {
            kind: RecordKind::Compensation {
                compensated_state: compensated_state.to_string(),
            },
            ..Self::forward(state_name, input, false, 1)
        }
    }

    pub fn in_branch(mut self, branch_id: Option<&str>) -> Self {
        self.branch_id = branch_id.map(str::to_string);
        self
    }

    pub fn succeeded(mut self, output: Value) -> Self {
        self.status = RecordStatus::Succeeded;
        self.output = Some(output);
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, failure: &StateFailure) -> Self {
        self.status = RecordStatus::Failed;
        self.failure = Some(FailureSummary::from(failure));
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.status = RecordStatus::Skipped;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.kind, RecordKind::Forward)
    }

    /// Name of the forward state this record compensates, if any
    pub fn compensated_state(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Compensation { compensated_state } => Some(compensated_state),
            RecordKind::Forward => None,
        }
    }

    /// Whether the participant may have applied its effect
    pub fn may_have_applied(&self) -> bool {
        matches!(
            self.status,
            RecordStatus::Succeeded | RecordStatus::Failed | RecordStatus::Unknown
        )
    }

    /// A durable effect that has not been confirmed either way
    pub fn is_unconfirmed_update(&self) -> bool {
        self.is_for_update && self.is_forward() && self.status == RecordStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failed_record_carries_summary() {
        let failure = StateFailure::business("Timeout", "participant timed out");
        let record = StateExecutionRecord::forward("Debit", json!({}), true, 1).failed(&failure);

        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.finished_at.is_some());
        let summary = record.failure.as_ref().unwrap();
        assert_eq!(summary.code, "Timeout");
        assert_eq!(summary.to_failure("Debit"), failure.in_state("Debit"));
    }

    #[test]
    fn test_compensation_record_is_not_forward() {
        let record = StateExecutionRecord::compensation("RefundDebit", "Debit", json!({}));
        assert!(!record.is_forward());
        assert_eq!(record.compensated_state(), Some("Debit"));
        assert!(!record.is_for_update);
    }

    #[test]
    fn test_unconfirmed_update_only_for_pending_forward_updates() {
        let pending = StateExecutionRecord::forward("Ship", json!({}), true, 1);
        assert!(pending.is_unconfirmed_update());

        let done = pending.clone().succeeded(json!("ok"));
        assert!(!done.is_unconfirmed_update());

        let read_only = StateExecutionRecord::forward("Quote", json!({}), false, 1);
        assert!(!read_only.is_unconfirmed_update());
        assert!(!read_only.clone().skipped().may_have_applied());
    }
}
