// State machine definitions: the read-only graph the executor walks
//
// Authoring formats are out of scope; definitions arrive as serde data (JSON
// in the CLI and tests) and are validated structurally before use.

pub mod provider;
pub mod types;

use thiserror::Error;

pub use provider::{DefinitionProvider, InMemoryDefinitionProvider};
pub use types::{
    find_catch, Branch, CatchRule, ChoiceRule, ChoiceState, FailState, ParallelState, RetryRule, State,
    StateMachine, TaskState,
};

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Failed to parse definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Start state '{0}' is not defined")]
    MissingStartState(String),

    #[error("State '{from}' references undefined state '{to}'")]
    UnknownState { from: String, to: String },

    #[error("State '{state}' declares compensate state '{compensate}' which is not a task")]
    CompensateStateNotTask { state: String, compensate: String },

    #[error("Parallel state '{state}' branch '{branch}' contains non-task state '{member}'")]
    BranchStateNotTask {
        state: String,
        branch: String,
        member: String,
    },

    #[error("Parallel state '{0}' has no branches")]
    EmptyParallel(String),
}

impl StateMachine {
    pub fn from_json(raw: &str) -> Result<Self, DefinitionError> {
        let machine: StateMachine = serde_json::from_str(raw)?;
        machine.validate()?;
        Ok(machine)
    }

    /// Structural checks: every referenced state exists, compensations and
    /// branch members are tasks
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.states.contains_key(&self.start_state) {
            return Err(DefinitionError::MissingStartState(self.start_state.clone()));
        }

        for (name, state) in &self.states {
            match state {
                State::Task(task) => {
                    self.check_target(name, task.next.as_deref())?;
                    for rule in &task.catches {
                        self.check_target(name, Some(&rule.next))?;
                    }
                    if let Some(compensate) = &task.compensate_state {
                        self.check_target(name, Some(compensate))?;
                        if self.task(compensate).is_none() {
                            return Err(DefinitionError::CompensateStateNotTask {
                                state: name.clone(),
                                compensate: compensate.clone(),
                            });
                        }
                    }
                }
                State::Choice(choice) => {
                    for rule in &choice.choices {
                        self.check_target(name, Some(&rule.next))?;
                    }
                    self.check_target(name, choice.default.as_deref())?;
                }
                State::Parallel(parallel) => {
                    if parallel.branches.is_empty() {
                        return Err(DefinitionError::EmptyParallel(name.clone()));
                    }
                    self.check_target(name, Some(&parallel.next))?;
                    for rule in &parallel.catches {
                        self.check_target(name, Some(&rule.next))?;
                    }
                    for branch in &parallel.branches {
                        self.check_branch(name, branch)?;
                    }
                }
                State::CompensationTrigger | State::Succeed | State::Fail(_) => {}
            }
        }
        Ok(())
    }

    fn check_target(&self, from: &str, to: Option<&str>) -> Result<(), DefinitionError> {
        match to {
            Some(to) if !self.states.contains_key(to) => Err(DefinitionError::UnknownState {
                from: from.to_string(),
                to: to.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn check_branch(&self, parallel: &str, branch: &Branch) -> Result<(), DefinitionError> {
        self.check_target(parallel, Some(&branch.start))?;
        let mut cursor = Some(branch.start.as_str());
        let mut visited = 0usize;
        while let Some(name) = cursor {
            let Some(task) = self.task(name) else {
                return Err(DefinitionError::BranchStateNotTask {
                    state: parallel.to_string(),
                    branch: branch.id.clone(),
                    member: name.to_string(),
                });
            };
            visited += 1;
            // a cycle inside a branch would never end the branch
            if visited > self.states.len() {
                return Err(DefinitionError::BranchStateNotTask {
                    state: parallel.to_string(),
                    branch: branch.id.clone(),
                    member: name.to_string(),
                });
            }
            cursor = task.next.as_deref();
        }
        Ok(())
    }
}
