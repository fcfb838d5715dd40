// Traversal of one instance over its state graph
//
// The executor dispatches state actions and follows the transitions chosen by
// the status decision strategy. It never classifies an outcome itself.

use futures::future::join_all;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use statig::prelude::*;
use tracing::{debug, error, info, warn};

use super::invoker::{Invocation, InvocationRequest};
use super::phase::{Phase, PhaseEvent, TraversalPhase};
use super::EngineShared;
use crate::config::RetryConfig;
use crate::domain::{ExecutionStatus, RecordStatus, StateExecutionRecord, StateMachineInstance};
use crate::error::{EngineError, EngineResult, StateFailure};
use crate::proctrl::{FramePhase, ProcessContext};
use crate::statelang::{
    find_catch, Branch, ChoiceState, FailState, ParallelState, RetryRule, State, StateMachine, TaskState,
};
use crate::store::TerminalUpdate;

/// What the traversal does after a state boundary
#[derive(Debug)]
pub(crate) enum Step {
    Next(String),
    Retry(Duration),
    Compensate(StateFailure),
    End(Option<StateFailure>),
    Suspend,
}

/// Delay before attempt `failures + 1`: `interval * rate^(failures - 1)`,
/// capped by the configured maximum, with optional jitter of up to 10%.
pub(crate) fn retry_delay(rule: &RetryRule, failures: u32, settings: &RetryConfig) -> Duration {
    let exponent = failures.saturating_sub(1) as i32;
    let scaled = rule.interval_ms as f64 * rule.backoff_rate.max(1.0).powi(exponent);
    let mut delay_ms = scaled.min(settings.max_interval_ms as f64) as u64;
    if settings.jitter && delay_ms > 0 {
        delay_ms += rand::rng().random_range(0..=delay_ms / 10);
    }
    Duration::from_millis(delay_ms)
}

/// Retry rule still allowing another attempt of `task`
fn retry_budget<'a>(
    task: &'a TaskState,
    failure: &StateFailure,
    failures: u32,
    settings: &RetryConfig,
) -> Option<&'a RetryRule> {
    let rule = task.find_retry(failure)?;
    let max_attempts = rule.max_attempts.unwrap_or(settings.default_max_attempts);
    (failures <= max_attempts).then_some(rule)
}

/// Variables handed to a compensating participant
fn compensation_input(forward: &StateExecutionRecord) -> Value {
    json!({
        "compensated_state": forward.state_name,
        "forward_input": forward.input,
        "forward_output": forward.output,
    })
}

pub(crate) struct Traversal {
    engine: Arc<EngineShared>,
    definition: Arc<StateMachine>,
    instance: StateMachineInstance,
    context: ProcessContext,
    /// Records already written to the repository
    persisted: usize,
}

impl Traversal {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        definition: Arc<StateMachine>,
        mut instance: StateMachineInstance,
        context: ProcessContext,
    ) -> Self {
        instance.attach_definition(Arc::clone(&definition));
        let persisted = instance.records().len();
        Self {
            engine,
            definition,
            instance,
            context,
            persisted,
        }
    }

    /// Drive the instance until it ends or suspends. `resume_with` replaces
    /// the first state execution when continuing from an async callback.
    pub(crate) async fn run(mut self, resume_with: Option<Step>) -> EngineResult<StateMachineInstance> {
        let mut phase = TraversalPhase::new(&self.instance.id).state_machine();
        phase.handle(&PhaseEvent::Start);
        let mut pending = resume_with;

        loop {
            let cursor = self.instance.current_state.clone();
            let step = match pending.take() {
                Some(step) => Ok(step),
                None => self.next_step(&cursor).await,
            };
            let step = match step {
                Ok(step) => step,
                Err(EngineError::Execution { instance_id, reason }) => {
                    self.abort(&cursor, &reason).await;
                    return Err(EngineError::Execution { instance_id, reason });
                }
                Err(e) => return Err(e),
            };

            match step {
                Step::Next(next) => {
                    phase.handle(&PhaseEvent::StateCompleted { state: cursor });
                    self.instance.current_state = next;
                    self.engine
                        .repository
                        .save_progress(&self.instance.id, &self.instance.current_state, &self.context.snapshot())
                        .await?;
                }
                Step::Retry(delay) => {
                    debug!(
                        instance_id = %self.instance.id,
                        state = %cursor,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying state"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Step::Compensate(failure) => {
                    phase.handle(&PhaseEvent::BeginCompensation);
                    if phase.inner().phase() != Phase::Compensating {
                        return Err(EngineError::IllegalState(format!(
                            "instance {} cannot compensate from phase {:?}",
                            self.instance.id,
                            phase.inner().phase()
                        )));
                    }
                    self.compensate().await?;
                    self.finish(Some(failure)).await?;
                    phase.handle(&PhaseEvent::Finish { status: self.instance.status });
                    return Ok(self.instance);
                }
                Step::End(exception) => {
                    self.finish(exception).await?;
                    phase.handle(&PhaseEvent::Finish { status: self.instance.status });
                    return Ok(self.instance);
                }
                Step::Suspend => {
                    phase.handle(&PhaseEvent::Suspend);
                    let snapshot = self.context.snapshot();
                    self.engine
                        .repository
                        .save_progress(&self.instance.id, &self.instance.current_state, &snapshot)
                        .await?;
                    self.instance.context_snapshot = snapshot;
                    info!(
                        instance_id = %self.instance.id,
                        state = %self.instance.current_state,
                        "Traversal suspended awaiting asynchronous participant"
                    );
                    return Ok(self.instance);
                }
            }
        }
    }

    async fn next_step(&mut self, cursor: &str) -> EngineResult<Step> {
        let definition = Arc::clone(&self.definition);
        let Some(state) = definition.state(cursor) else {
            return Err(self.execution_error(format!("state '{}' is not defined", cursor)));
        };

        if !state.is_end() && self.engine.take_cancellation(&self.instance.id) {
            info!(instance_id = %self.instance.id, state = %cursor, "Cancellation observed at state boundary");
            return self.handle_failure(StateFailure::cancelled(cursor), true).await;
        }

        self.context.push_frame(cursor, FramePhase::Forward);
        let step = match state {
            State::Task(task) => self.execute_task(cursor, task).await,
            State::Choice(choice) => self.route_choice(cursor, choice),
            State::Parallel(parallel) => self.execute_parallel(cursor, parallel).await,
            State::CompensationTrigger => {
                let failure = self.context.exception().cloned().unwrap_or_else(|| {
                    StateFailure::business(
                        "CompensationTriggered",
                        format!("compensation triggered by state '{}'", cursor),
                    )
                    .in_state(cursor)
                });
                Ok(Step::Compensate(failure))
            }
            State::Succeed => Ok(Step::End(self.context.take_exception())),
            State::Fail(fail) => Ok(Step::End(Some(self.fail_state_failure(cursor, fail)))),
        };
        self.context.pop_frame();
        step
    }

    fn fail_state_failure(&mut self, name: &str, fail: &FailState) -> StateFailure {
        self.context
            .take_exception()
            .unwrap_or_else(|| fail.to_failure(name))
    }

    async fn execute_task(&mut self, name: &str, task: &TaskState) -> EngineResult<Step> {
        let attempt = self.instance.consecutive_failures(name, None) + 1;
        let request = InvocationRequest {
            instance_id: self.instance.id.clone(),
            state_name: name.to_string(),
            service: task.service.clone(),
            method: task.method.clone(),
            input: self.context.snapshot(),
            attempt,
            branch_id: None,
            compensation: false,
        };

        match self.engine.invoker.invoke(&request).await {
            Ok(Invocation::Completed(output)) => {
                let record = StateExecutionRecord::forward(name, request.input, task.is_for_update, attempt)
                    .succeeded(output.clone());
                self.instance.append_record(record);
                self.flush_records().await?;
                self.complete_task(name, task, output)
            }
            Ok(Invocation::Pending) => {
                let record = StateExecutionRecord::forward(name, request.input, task.is_for_update, attempt);
                self.instance.append_record(record);
                self.flush_records().await?;
                Ok(Step::Suspend)
            }
            Err(failure) => self.handle_failure(failure.in_state(name), false).await,
        }
    }

    /// Apply a successful task output and move to its successor
    pub(crate) fn complete_task(&mut self, name: &str, task: &TaskState, output: Value) -> EngineResult<Step> {
        self.context.clear_exception();
        if let Some(key) = &task.output_key {
            self.context.set_variable(key.clone(), output);
        }
        match &task.next {
            Some(next) => Ok(Step::Next(next.clone())),
            None => Err(self.execution_error(format!("task state '{}' has no next state", name))),
        }
    }

    /// Record a failure through the strategy and follow its routing decision
    pub(crate) async fn handle_failure(&mut self, failure: StateFailure, forced: bool) -> EngineResult<Step> {
        self.engine
            .strategy
            .decide_on_task_state_fail(&mut self.context, &mut self.instance, &failure)?;
        self.flush_records().await?;
        self.route_failure(failure, forced)
    }

    fn special_policy(&self, forced: bool) -> bool {
        forced || self.context.force_compensation_requested() || self.engine.config.get().policy.force_compensation
    }

    fn route_failure(&mut self, failure: StateFailure, forced: bool) -> EngineResult<Step> {
        let special = self.special_policy(forced);
        if !self
            .engine
            .strategy
            .decide_machine_forward_execution_status(&self.instance, &failure, special)
        {
            return Ok(Step::Compensate(failure));
        }

        let state_name = failure.state_name.clone().unwrap_or_default();
        let settings = self.engine.config.get().retry.clone();
        let definition = Arc::clone(&self.definition);
        if let Some(task) = definition.task(&state_name) {
            let failures = self.instance.consecutive_failures(&state_name, None);
            if let Some(rule) = retry_budget(task, &failure, failures, &settings) {
                return Ok(Step::Retry(retry_delay(rule, failures, &settings)));
            }
        }
        let catch = find_catch(definition.catches_of(&state_name), &failure);

        match catch {
            Some(rule) => {
                info!(
                    instance_id = %self.instance.id,
                    state = %state_name,
                    code = %failure.code,
                    next = %rule.next,
                    "Failure caught, continuing forward"
                );
                self.context.clear_exception();
                Ok(Step::Next(rule.next.clone()))
            }
            None => {
                warn!(
                    instance_id = %self.instance.id,
                    state = %state_name,
                    "Strategy chose forward execution but no retry or catch applies, compensating"
                );
                Ok(Step::Compensate(failure))
            }
        }
    }

    fn route_choice(&self, name: &str, choice: &ChoiceState) -> EngineResult<Step> {
        let matched = choice
            .choices
            .iter()
            .find(|rule| self.context.variable(&rule.variable) == Some(&rule.equals));
        match matched {
            Some(rule) => Ok(Step::Next(rule.next.clone())),
            None => choice
                .default
                .clone()
                .map(Step::Next)
                .ok_or_else(|| self.execution_error(format!("no choice matched in state '{}'", name))),
        }
    }

    async fn execute_parallel(&mut self, name: &str, parallel: &ParallelState) -> EngineResult<Step> {
        let base = self.instance.records().len();
        let runs = parallel.branches.iter().map(|branch| {
            run_branch(
                Arc::clone(&self.engine),
                Arc::clone(&self.definition),
                branch.clone(),
                self.context.fork(&branch.id),
                self.instance.clone(),
                self.special_policy(false),
            )
        });
        let outcomes = join_all(runs).await;

        let mut branch_failure = None;
        for outcome in outcomes {
            let (scratch, result) = outcome;
            for record in &scratch.records()[base..] {
                self.instance.append_record(record.clone());
            }
            match result {
                Ok(()) => {}
                Err(BranchError::Engine(e)) => {
                    self.flush_records().await?;
                    return Err(e);
                }
                Err(BranchError::Failed(failure)) => {
                    if branch_failure.is_none() {
                        branch_failure = Some(failure);
                    }
                }
            }
        }
        self.flush_records().await?;

        match branch_failure {
            None => Ok(Step::Next(parallel.next.clone())),
            Some(failure) => {
                let failure = StateFailure {
                    state_name: Some(name.to_string()),
                    ..failure
                };
                warn!(instance_id = %self.instance.id, state = %name, failure = %failure, "Parallel branch failed");
                self.context.set_exception(failure.clone());
                self.route_failure(failure, false)
            }
        }
    }

    /// Undo completed work, newest first
    async fn compensate(&mut self) -> EngineResult<()> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for record in self.instance.records().iter().rev() {
            if !record.is_forward() {
                continue;
            }
            if !seen.insert((record.state_name.clone(), record.branch_id.clone())) {
                continue;
            }
            let applied = record.status == RecordStatus::Succeeded
                || (record.is_for_update && record.may_have_applied());
            if !applied {
                continue;
            }
            if let Some(compensate_state) = self
                .definition
                .task(&record.state_name)
                .and_then(|task| task.compensate_state.clone())
            {
                targets.push((compensate_state, record.clone()));
            }
        }

        info!(instance_id = %self.instance.id, targets = targets.len(), "Compensating executed states");
        for (compensate_state, forward) in targets {
            self.compensate_one(&compensate_state, &forward).await?;
        }
        Ok(())
    }

    async fn compensate_one(&mut self, compensate_state: &str, forward: &StateExecutionRecord) -> EngineResult<()> {
        let definition = Arc::clone(&self.definition);
        let Some(task) = definition.task(compensate_state) else {
            return Err(self.execution_error(format!("compensate state '{}' is not a task", compensate_state)));
        };
        let settings = self.engine.config.get().retry.clone();
        let input = compensation_input(forward);
        self.context.push_frame(compensate_state, FramePhase::Compensating);

        let mut attempt = 1;
        let mut record = loop {
            let request = InvocationRequest {
                instance_id: self.instance.id.clone(),
                state_name: compensate_state.to_string(),
                service: task.service.clone(),
                method: task.method.clone(),
                input: input.clone(),
                attempt,
                branch_id: forward.branch_id.clone(),
                compensation: true,
            };
            let base = StateExecutionRecord::compensation(compensate_state, &forward.state_name, input.clone())
                .in_branch(forward.branch_id.as_deref());
            match self.engine.invoker.invoke(&request).await {
                Ok(Invocation::Completed(output)) => break base.succeeded(output),
                Ok(Invocation::Pending) => {
                    warn!(
                        instance_id = %self.instance.id,
                        state = %compensate_state,
                        "Compensation left pending, its outcome stays unknown"
                    );
                    break base;
                }
                Err(failure) => {
                    let failure = failure.in_state(compensate_state);
                    if let Some(rule) = retry_budget(task, &failure, attempt, &settings) {
                        let delay = retry_delay(rule, attempt, &settings);
                        debug!(state = %compensate_state, attempt = attempt, "Retrying compensation");
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        attempt += 1;
                        continue;
                    }
                    error!(
                        instance_id = %self.instance.id,
                        state = %compensate_state,
                        compensated = %forward.state_name,
                        failure = %failure,
                        "Compensation failed"
                    );
                    break base.failed(&failure);
                }
            }
        };
        record.attempt = attempt;
        self.instance.append_record(record);
        self.flush_records().await?;
        self.context.pop_frame();
        Ok(())
    }

    /// End decision plus the single authoritative terminal write
    async fn finish(&mut self, exception: Option<StateFailure>) -> EngineResult<()> {
        if self.engine.take_cancellation(&self.instance.id) {
            debug!(instance_id = %self.instance.id, "Cancellation request dropped, instance is ending");
        }
        self.engine
            .strategy
            .decide_on_end_state(&mut self.context, &mut self.instance, exception.as_ref())?;
        self.flush_records().await?;

        let update = TerminalUpdate::from_instance(&self.instance);
        let won = self
            .engine
            .repository
            .compare_and_swap_status(&self.instance.id, ExecutionStatus::Running, &update)
            .await?;
        if !won {
            return Err(EngineError::IllegalState(format!(
                "instance {} was already finished by another writer",
                self.instance.id
            )));
        }
        Ok(())
    }

    /// Best-effort end decision after an engine execution error
    pub(crate) async fn abort(&mut self, cursor: &str, reason: &str) {
        error!(instance_id = %self.instance.id, state = %cursor, reason = %reason, "Engine execution error");
        let failure = StateFailure::execution("EngineExecution", reason.to_string()).in_state(cursor);
        if let Err(e) = self.finish(Some(failure)).await {
            error!(instance_id = %self.instance.id, error = %e, "Failed to record end state after execution error");
        }
    }

    pub(crate) async fn record(&mut self, record: StateExecutionRecord) -> EngineResult<()> {
        self.instance.append_record(record);
        self.flush_records().await
    }

    async fn flush_records(&mut self) -> EngineResult<()> {
        for record in &self.instance.records()[self.persisted..] {
            self.engine
                .repository
                .append_record(&self.instance.id, record)
                .await?;
        }
        self.persisted = self.instance.records().len();
        Ok(())
    }

    fn execution_error(&self, reason: String) -> EngineError {
        EngineError::Execution {
            instance_id: self.instance.id.clone(),
            reason,
        }
    }
}

enum BranchError {
    Failed(StateFailure),
    Engine(EngineError),
}

/// Run one parallel branch against a scratch copy of the instance. New
/// records are returned in the copy; the caller merges them in branch order.
async fn run_branch(
    engine: Arc<EngineShared>,
    definition: Arc<StateMachine>,
    branch: Branch,
    mut context: ProcessContext,
    mut scratch: StateMachineInstance,
    special_policy: bool,
) -> (StateMachineInstance, Result<(), BranchError>) {
    let settings = engine.config.get().retry.clone();
    let mut cursor = Some(branch.start.clone());

    while let Some(name) = cursor.take() {
        let Some(task) = definition.task(&name) else {
            let error = EngineError::Execution {
                instance_id: scratch.id.clone(),
                reason: format!("branch '{}' references non-task state '{}'", branch.id, name),
            };
            return (scratch, Err(BranchError::Engine(error)));
        };
        context.push_frame(&name, FramePhase::Forward);

        let attempt = scratch.consecutive_failures(&name, Some(&branch.id)) + 1;
        let request = InvocationRequest {
            instance_id: scratch.id.clone(),
            state_name: name.clone(),
            service: task.service.clone(),
            method: task.method.clone(),
            input: context.snapshot(),
            attempt,
            branch_id: Some(branch.id.clone()),
            compensation: false,
        };
        let outcome = engine.invoker.invoke(&request).await;
        context.pop_frame();

        let failure = match outcome {
            Ok(Invocation::Completed(output)) => {
                let record = StateExecutionRecord::forward(&name, request.input, task.is_for_update, attempt)
                    .in_branch(Some(&branch.id))
                    .succeeded(output.clone());
                scratch.append_record(record);
                if let Some(key) = &task.output_key {
                    context.set_variable(key.clone(), output);
                }
                cursor = task.next.clone();
                continue;
            }
            Ok(Invocation::Pending) => {
                let record = StateExecutionRecord::forward(&name, request.input, task.is_for_update, attempt)
                    .in_branch(Some(&branch.id));
                scratch.append_record(record);
                return (
                    scratch,
                    Err(BranchError::Failed(
                        StateFailure::execution(
                            "PendingInBranch",
                            format!("asynchronous participant in branch '{}' is not supported", branch.id),
                        )
                        .in_state(&name),
                    )),
                );
            }
            Err(failure) => failure.in_state(&name),
        };

        if let Err(e) = engine
            .strategy
            .decide_on_task_state_fail(&mut context, &mut scratch, &failure)
        {
            return (scratch, Err(BranchError::Engine(e)));
        }
        let forward = engine
            .strategy
            .decide_machine_forward_execution_status(&scratch, &failure, special_policy);
        let failures = scratch.consecutive_failures(&name, Some(&branch.id));
        match retry_budget(task, &failure, failures, &settings).filter(|_| forward) {
            Some(rule) => {
                let delay = retry_delay(rule, failures, &settings);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                cursor = Some(name);
            }
            None => return (scratch, Err(BranchError::Failed(failure))),
        }
    }

    debug!(instance_id = %scratch.id, branch = %branch.id, "Branch completed");
    (scratch, Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn rule(interval_ms: u64, backoff_rate: f64) -> RetryRule {
        RetryRule {
            exceptions: vec![],
            max_attempts: None,
            interval_ms,
            backoff_rate,
        }
    }

    #[test]
    fn test_retry_delay_grows_by_backoff_rate() {
        let settings = EngineConfig::default().retry;
        let rule = rule(100, 2.0);

        assert_eq!(retry_delay(&rule, 1, &settings), Duration::from_millis(100));
        assert_eq!(retry_delay(&rule, 2, &settings), Duration::from_millis(200));
        assert_eq!(retry_delay(&rule, 4, &settings), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_delay_capped_by_max_interval() {
        let settings = RetryConfig {
            max_interval_ms: 250,
            ..EngineConfig::default().retry
        };
        assert_eq!(retry_delay(&rule(100, 3.0), 3, &settings), Duration::from_millis(250));
    }

    #[test]
    fn test_retry_delay_jitter_stays_within_ten_percent() {
        let settings = RetryConfig {
            jitter: true,
            ..EngineConfig::default().retry
        };
        for _ in 0..20 {
            let delay = retry_delay(&rule(1000, 1.0), 1, &settings);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_retry_budget_counts_failures_against_max_attempts() {
        let task: TaskState = serde_json::from_value(json!({
            "service": "pay",
            "retry": [{ "exceptions": ["Timeout"], "max_attempts": 2 }]
        }))
        .unwrap();
        let settings = EngineConfig::default().retry;
        let timeout = StateFailure::business("Timeout", "slow");

        assert!(retry_budget(&task, &timeout, 1, &settings).is_some());
        assert!(retry_budget(&task, &timeout, 2, &settings).is_some());
        assert!(retry_budget(&task, &timeout, 3, &settings).is_none());
        assert!(retry_budget(&task, &StateFailure::business("Other", ""), 1, &settings).is_none());
    }
}
