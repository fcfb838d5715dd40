// Immutable state graph handed to the executor

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{FailureKind, StateFailure};

/// A named, validated directed graph of states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    pub name: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub start_state: String,
    pub states: BTreeMap<String, State>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum State {
    Task(TaskState),
    Choice(ChoiceState),
    Parallel(ParallelState),
    /// Starts backward execution of everything done so far
    CompensationTrigger,
    Succeed,
    Fail(FailState),
}

impl State {
    pub fn is_end(&self) -> bool {
        matches!(self, State::Succeed | State::Fail(_))
    }
}

/// A business action invoked on a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub service: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// True if the participant mutates durable data
    #[serde(default)]
    pub is_for_update: bool,
    /// Task state that undoes this one
    #[serde(default)]
    pub compensate_state: Option<String>,
    #[serde(default)]
    pub retry: Vec<RetryRule>,
    #[serde(default)]
    pub catches: Vec<CatchRule>,
    /// Context variable receiving the participant's output
    #[serde(default)]
    pub output_key: Option<String>,
    /// `None` ends a parallel branch; on the main path it is an engine error
    #[serde(default)]
    pub next: Option<String>,
}

fn default_method() -> String {
    "execute".to_string()
}

fn default_backoff_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRule {
    /// Failure codes this rule applies to; empty matches any business failure
    #[serde(default)]
    pub exceptions: Vec<String>,
    /// Falls back to the engine's configured default when absent
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

/// The "ignore" transition: record the failure and continue at `next`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchRule {
    #[serde(default)]
    pub exceptions: Vec<String>,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceState {
    pub choices: Vec<ChoiceRule>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    pub variable: String,
    pub equals: Value,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelState {
    pub branches: Vec<Branch>,
    pub next: String,
    #[serde(default)]
    pub catches: Vec<CatchRule>,
}

/// A chain of task states linked by `next`, ending at a task without one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub start: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailState {
    #[serde(default = "default_fail_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

fn default_fail_code() -> String {
    "Failed".to_string()
}

impl FailState {
    pub fn to_failure(&self, state_name: &str) -> StateFailure {
        StateFailure::business(self.code.clone(), self.message.clone()).in_state(state_name)
    }
}

fn matches_code(exceptions: &[String], failure: &StateFailure) -> bool {
    exceptions.is_empty() || exceptions.iter().any(|code| code == &failure.code)
}

impl RetryRule {
    /// Only business failures are retried
    pub fn matches(&self, failure: &StateFailure) -> bool {
        failure.kind == FailureKind::Business && matches_code(&self.exceptions, failure)
    }
}

impl CatchRule {
    pub fn matches(&self, failure: &StateFailure) -> bool {
        failure.kind != FailureKind::Execution && matches_code(&self.exceptions, failure)
    }
}

/// First catch rule applying to a failure
pub fn find_catch<'a>(catches: &'a [CatchRule], failure: &StateFailure) -> Option<&'a CatchRule> {
    catches.iter().find(|rule| rule.matches(failure))
}

impl TaskState {
    pub fn find_retry(&self, failure: &StateFailure) -> Option<&RetryRule> {
        self.retry.iter().find(|rule| rule.matches(failure))
    }
}

impl StateMachine {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    pub fn task(&self, name: &str) -> Option<&TaskState> {
        match self.states.get(name) {
            Some(State::Task(task)) => Some(task),
            _ => None,
        }
    }

    /// Catch rules declared on a state, whatever its kind
    pub fn catches_of(&self, name: &str) -> &[CatchRule] {
        match self.states.get(name) {
            Some(State::Task(task)) => &task.catches,
            Some(State::Parallel(parallel)) => &parallel.catches,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_defaults() {
        let state: State = serde_json::from_value(json!({
            "type": "Task",
            "service": "inventory"
        }))
        .unwrap();

        let State::Task(task) = state else {
            panic!("expected task");
        };
        assert_eq!(task.method, "execute");
        assert!(!task.is_for_update);
        assert!(task.retry.is_empty());
        assert!(task.next.is_none());
    }

    #[test]
    fn test_retry_rule_matching() {
        let rule = RetryRule {
            exceptions: vec!["Timeout".to_string()],
            max_attempts: Some(2),
            interval_ms: 0,
            backoff_rate: 1.0,
        };
        assert!(rule.matches(&StateFailure::business("Timeout", "")));
        assert!(!rule.matches(&StateFailure::business("Declined", "")));
        assert!(!rule.matches(&StateFailure::cancelled("A")));

        let any = RetryRule { exceptions: vec![], ..rule };
        assert!(any.matches(&StateFailure::business("Declined", "")));
        assert!(!any.matches(&StateFailure::execution("Corrupt", "")));
    }

    #[test]
    fn test_catch_ignores_execution_failures() {
        let rule = CatchRule { exceptions: vec![], next: "Next".to_string() };
        assert!(rule.matches(&StateFailure::business("X", "")));
        assert!(rule.matches(&StateFailure::cancelled("A")));
        assert!(!rule.matches(&StateFailure::execution("X", "")));
    }

    #[test]
    fn test_catches_of_task_and_parallel() {
        let machine: StateMachine = serde_json::from_value(json!({
            "name": "m",
            "start_state": "Fan",
            "states": {
                "Fan": { "type": "Parallel", "branches": [{ "id": "b", "start": "Work" }], "next": "Done",
                         "catches": [{ "next": "Done" }] },
                "Work": { "type": "Task", "service": "w",
                          "catches": [{ "exceptions": ["Declined"], "next": "Done" }] },
                "Done": { "type": "Succeed" }
            }
        }))
        .unwrap();

        assert_eq!(machine.catches_of("Fan").len(), 1);
        assert_eq!(machine.catches_of("Work")[0].exceptions, vec!["Declined".to_string()]);
        assert!(machine.catches_of("Done").is_empty());
        assert!(machine.catches_of("Missing").is_empty());

        let failure = StateFailure::business("Timeout", "");
        assert!(find_catch(machine.catches_of("Work"), &failure).is_none());
        assert!(find_catch(machine.catches_of("Fan"), &failure).is_some());
    }
}
