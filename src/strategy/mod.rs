// Status decision strategies: the sole authority classifying saga outcomes
//
// The executor asks; it never derives a status on its own. Strategies are
// selected when the engine is built and may read hot-swapped tunables.

pub mod always_compensate;
pub mod default;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ConfigHandle, StrategyKind};
use crate::domain::StateMachineInstance;
use crate::error::{EngineResult, StateFailure};
use crate::proctrl::ProcessContext;

pub use always_compensate::AlwaysCompensateStrategy;
pub use default::DefaultStatusDecisionStrategy;

/// How a compensation action that itself fails is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationFailurePolicy {
    /// The compensated state stays uncompensated; only states marked for
    /// update turn the verdict Inconsistent
    #[default]
    Uncompensated,
    /// Any failed compensation is its own Inconsistent sub-verdict and makes
    /// the whole instance Inconsistent
    Escalate,
}

pub trait StatusDecisionStrategy: Send + Sync {
    /// Write the terminal status once the traversal reaches an end state.
    /// Fails with an illegal-state error if the instance is already terminal.
    fn decide_on_end_state(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: Option<&StateFailure>,
    ) -> EngineResult<()>;

    /// Record a task failure and hold it in the context. Routing is left to
    /// `decide_machine_forward_execution_status`.
    fn decide_on_task_state_fail(
        &self,
        context: &mut ProcessContext,
        instance: &mut StateMachineInstance,
        exception: &StateFailure,
    ) -> EngineResult<()>;

    /// `true` continues forward (retry or ignore), `false` compensates.
    /// `special_policy` forces `false`.
    fn decide_machine_forward_execution_status(
        &self,
        instance: &StateMachineInstance,
        exception: &StateFailure,
        special_policy: bool,
    ) -> bool;
}

/// Build the strategy named by the current configuration
pub fn from_config(config: &ConfigHandle) -> Arc<dyn StatusDecisionStrategy> {
    let default = DefaultStatusDecisionStrategy::new(config.clone());
    match config.get().policy.strategy {
        StrategyKind::Default => Arc::new(default),
        StrategyKind::AlwaysCompensate => Arc::new(AlwaysCompensateStrategy::new(default)),
    }
}
