use super::{DefaultStatusDecisionStrategy, StatusDecisionStrategy};
use crate::domain::StateMachineInstance;
use crate::error::{EngineResult, StateFailure};
use crate::proctrl::ProcessContext;

/// Stricter policy: any task failure rolls the saga back, retry and ignore
/// rules are never honoured. Terminal verdicts match the default policy.
#[derive(Debug, Clone, Default)]
pub struct AlwaysCompensateStrategy {
    inner: DefaultStatusDecisionStrategy,
}

impl AlwaysCompensateStrategy {
    pub fn new(inner: DefaultStatusDecisionStrategy) -> Self {
        Self { inner }
    }
}

impl StatusDecisionStrategy for AlwaysCompensateStrategy {
    fn decide_on_end_state(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: Option<&StateFailure>,
    ) -> EngineResult<()> {
        self.inner.decide_on_end_state(context, instance, exception)
    }

    fn decide_on_task_state_fail(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: &StateFailure,
    ) -> EngineResult<()> {
        self.inner.decide_on_task_state_fail(context, instance, exception)
    }

    fn decide_machine_forward_execution_status(
        &self,
        _instance: &StateMachineInstance,
        _exception: &StateFailure,
        _special_policy: bool,
    ) -> bool {
        false
    }
}
