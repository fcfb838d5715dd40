use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{CompensationFailurePolicy, StatusDecisionStrategy};
use crate::config::ConfigHandle;
use crate::domain::{ExecutionStatus, RecordKind, RecordStatus, StateExecutionRecord, StateMachineInstance};
use crate::error::{EngineError, EngineResult, FailureKind, StateFailure};
use crate::proctrl::ProcessContext;
use crate::statelang::find_catch;

type StateKey<'a> = (&'a str, Option<&'a str>);

fn key_of(record: &StateExecutionRecord) -> StateKey<'_> {
    let name = record.compensated_state().unwrap_or(&record.state_name);
    (name, record.branch_id.as_deref())
}

/// Outcome of scanning an instance's records newest-first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: ExecutionStatus,
    pub compensation_status: Option<ExecutionStatus>,
}

/// Classify a failed instance from its record sequence.
///
/// A state is uncompensated when its latest forward record is marked for
/// update, may have applied its effect, and no later compensation record for
/// it succeeded.
pub fn classify_failure(
    records: &[StateExecutionRecord],
    policy: CompensationFailurePolicy,
) -> Verdict {
    let mut latest_compensation: HashMap<StateKey<'_>, RecordStatus> = HashMap::new();
    let mut seen_forward: HashSet<StateKey<'_>> = HashSet::new();
    let mut uncompensated = false;
    let mut compensated_any = false;
    let mut compensation_failed = false;

    for record in records.iter().rev() {
        let key = key_of(record);
        match &record.kind {
            RecordKind::Compensation { .. } => {
                compensated_any = true;
                if record.status != RecordStatus::Succeeded {
                    compensation_failed = true;
                }
                latest_compensation.entry(key).or_insert(record.status);
            }
            RecordKind::Forward => {
                if !seen_forward.insert(key) {
                    continue;
                }
                if record.is_for_update && record.may_have_applied() {
                    let confirmed = latest_compensation.get(&key) == Some(&RecordStatus::Succeeded);
                    if !confirmed {
                        uncompensated = true;
                    }
                }
            }
        }
    }

    let compensation_status = if !compensated_any {
        None
    } else if !compensation_failed {
        Some(ExecutionStatus::Succeeded)
    } else {
        match policy {
            CompensationFailurePolicy::Uncompensated => Some(ExecutionStatus::Failed),
            CompensationFailurePolicy::Escalate => Some(ExecutionStatus::Inconsistent),
        }
    };

    let escalated = compensation_status == Some(ExecutionStatus::Inconsistent);
    let status = if uncompensated || escalated {
        ExecutionStatus::Inconsistent
    } else {
        ExecutionStatus::Failed
    };

    Verdict {
        status,
        compensation_status,
    }
}

/// True if some state other than `failing` has an update that was dispatched
/// but never confirmed
fn has_unconfirmed_update(instance: &StateMachineInstance, failing: StateKey<'_>) -> bool {
    let mut seen: HashSet<StateKey<'_>> = HashSet::new();
    instance
        .records()
        .iter()
        .rev()
        .filter(|r| r.is_forward())
        .filter(|r| seen.insert(key_of(r)))
        .any(|r| key_of(r) != failing && r.is_unconfirmed_update())
}

/// Default consistency policy: continue forward when the failing state
/// declares a retry or ignore rule for the failure, otherwise compensate.
#[derive(Debug, Clone, Default)]
pub struct DefaultStatusDecisionStrategy {
    config: ConfigHandle,
}

impl DefaultStatusDecisionStrategy {
    pub fn new(config: ConfigHandle) -> Self {
        Self { config }
    }

    fn ensure_running(instance: &StateMachineInstance, operation: &str) -> EngineResult<()> {
        if instance.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "{} called on instance {} which already finished with status {}",
                operation, instance.id, instance.status
            )));
        }
        Ok(())
    }

    /// Whether the failing state declares a rule letting execution continue
    fn has_forward_rule(&self, instance: &StateMachineInstance, exception: &StateFailure) -> bool {
        let Some(state_name) = exception.state_name.as_deref() else {
            return false;
        };
        let Some(definition) = instance.definition() else {
            warn!(instance_id = %instance.id, "No definition attached, cannot evaluate forward rules");
            return false;
        };

        if find_catch(definition.catches_of(state_name), exception).is_some() {
            return true;
        }
        let Some(rule) = definition
            .task(state_name)
            .and_then(|task| task.find_retry(exception))
        else {
            return false;
        };
        let max_attempts = rule
            .max_attempts
            .unwrap_or(self.config.get().retry.default_max_attempts);
        let branch = instance
            .records()
            .iter()
            .rev()
            .find(|r| r.is_forward() && r.state_name == state_name)
            .and_then(|r| r.branch_id.as_deref());
        instance.consecutive_failures(state_name, branch) <= max_attempts
    }
}

impl StatusDecisionStrategy for DefaultStatusDecisionStrategy {
    fn decide_on_end_state(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: Option<&StateFailure>,
    ) -> EngineResult<()> {
        Self::ensure_running(instance, "decide_on_end_state")?;

        let Some(exception) = exception else {
            instance.set_terminal_status(ExecutionStatus::Succeeded)?;
            info!(instance_id = %instance.id, status = %instance.status, "State machine finished");
            return Ok(());
        };

        let policy = self.config.get().policy.compensation_failure;
        let verdict = classify_failure(instance.records(), policy);
        instance.compensation_status = verdict.compensation_status;
        instance.set_terminal_status(verdict.status)?;
        context.set_exception(exception.clone());

        info!(
            instance_id = %instance.id,
            status = %instance.status,
            compensation_status = ?instance.compensation_status,
            failure = %exception,
            "State machine finished with failure"
        );
        Ok(())
    }

    fn decide_on_task_state_fail(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: &StateFailure,
    ) -> EngineResult<()> {
        Self::ensure_running(instance, "decide_on_task_state_fail")?;

        let state_name = exception
            .state_name
            .clone()
            .unwrap_or_else(|| instance.current_state.clone());
        // a cancelled state was never invoked, so it applied nothing
        let is_for_update = exception.kind != FailureKind::Cancelled
            && instance
                .definition()
                .and_then(|definition| definition.task(&state_name))
                .is_some_and(|task| task.is_for_update);
        let attempt = instance.consecutive_failures(&state_name, context.branch_id()) + 1;

        let record = StateExecutionRecord::forward(&state_name, context.snapshot(), is_for_update, attempt)
            .in_branch(context.branch_id())
            .failed(exception);
        let seq = instance.append_record(record).seq;
        context.set_exception(exception.clone().in_state(&state_name));

        warn!(
            instance_id = %instance.id,
            state = %state_name,
            branch = ?context.branch_id(),
            seq = seq,
            attempt = attempt,
            failure = %exception,
            "Task state failed"
        );
        Ok(())
    }

    fn decide_machine_forward_execution_status(
        &self,
        instance: &StateMachineInstance,
        exception: &StateFailure,
        special_policy: bool,
    ) -> bool {
        if special_policy {
            debug!(instance_id = %instance.id, "Special policy forces compensation");
            return false;
        }

        if !self.has_forward_rule(instance, exception) {
            return false;
        }

        let failing_state = exception.state_name.as_deref().unwrap_or_default();
        let failing_branch = instance
            .records()
            .iter()
            .rev()
            .find(|r| r.is_forward() && r.state_name == failing_state)
            .and_then(|r| r.branch_id.as_deref());
        if has_unconfirmed_update(instance, (failing_state, failing_branch)) {
            debug!(
                instance_id = %instance.id,
                state = %failing_state,
                "Unconfirmed update recorded earlier, compensating instead of continuing"
            );
            return false;
        }
        true
    }
}
