use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StateFailure;

/// Business flag forcing compensation on the next failure when set to `true`
pub const FORCE_COMPENSATION_VAR: &str = "__force_compensation";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Forward,
    Compensating,
}

/// One entry of the execution stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub state_name: String,
    pub phase: FramePhase,
    pub branch_id: Option<String>,
}

/// Mutable carrier of execution state for exactly one traversal.
///
/// Variables are copy-on-write: a fork shares the parent's map until either
/// side writes, so writes in a branch never reach the parent. Durable facts
/// live in the instance records, never here.
#[derive(Debug)]
pub struct ProcessContext {
    instance_id: String,
    branch_id: Option<String>,
    variables: Arc<HashMap<String, Value>>,
    exception: Option<StateFailure>,
    stack: Vec<Frame>,
}

impl ProcessContext {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            branch_id: None,
            variables: Arc::new(HashMap::new()),
            exception: None,
            stack: Vec::new(),
        }
    }

    /// Rebuild a fresh context from a persisted variable snapshot
    pub fn from_snapshot(instance_id: &str, snapshot: &Value) -> Self {
        let mut context = Self::new(instance_id);
        if let Value::Object(map) = snapshot {
            context.variables = Arc::new(map.clone().into_iter().collect());
        }
        context
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn branch_id(&self) -> Option<&str> {
        self.branch_id.as_deref()
    }

    /// Last write wins
    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.variables).insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn has_variable(&self, key: &str) -> bool {
        self.variables.contains_key(key)
    }

    pub fn extend_variables(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        Arc::make_mut(&mut self.variables).extend(values);
    }

    /// Variables as a JSON object, used as participant input and for snapshots
    pub fn snapshot(&self) -> Value {
        let map: Map<String, Value> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Holding an exception puts the traversal on the error-handling path.
    /// At most one is held; a new one replaces the old.
    pub fn set_exception(&mut self, failure: StateFailure) {
        self.exception = Some(failure);
    }

    pub fn exception(&self) -> Option<&StateFailure> {
        self.exception.as_ref()
    }

    pub fn take_exception(&mut self) -> Option<StateFailure> {
        self.exception.take()
    }

    pub fn clear_exception(&mut self) {
        self.exception = None;
    }

    pub fn is_handling_error(&self) -> bool {
        self.exception.is_some()
    }

    pub fn push_frame(&mut self, state_name: &str, phase: FramePhase) {
        self.stack.push(Frame {
            state_name: state_name.to_string(),
            phase,
            branch_id: self.branch_id.clone(),
        });
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.stack.pop()
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn force_compensation_requested(&self) -> bool {
        matches!(self.variable(FORCE_COMPENSATION_VAR), Some(Value::Bool(true)))
    }

    /// Context for a concurrently executed branch. Shares variables
    /// copy-on-write; exception holder and stack start empty.
    pub fn fork(&self, branch_id: &str) -> ProcessContext {
        Self {
            instance_id: self.instance_id.clone(),
            branch_id: Some(branch_id.to_string()),
            variables: Arc::clone(&self.variables),
            exception: None,
            stack: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_variables_last_write_wins() {
        let mut context = ProcessContext::new("i-1");
        assert!(!context.has_variable("amount"));

        context.set_variable("amount", json!(10));
        context.set_variable("amount", json!(25));

        assert!(context.has_variable("amount"));
        assert_eq!(context.variable("amount"), Some(&json!(25)));
    }

    #[test]
    fn test_exception_holder_marks_error_path() {
        let mut context = ProcessContext::new("i-1");
        assert!(!context.is_handling_error());

        context.set_exception(StateFailure::business("A", "first"));
        context.set_exception(StateFailure::business("B", "second"));
        assert_eq!(context.exception().map(|f| f.code.as_str()), Some("B"));

        let taken = context.take_exception().unwrap();
        assert_eq!(taken.code, "B");
        assert!(!context.is_handling_error());
    }

    #[test]
    fn test_fork_writes_do_not_reach_parent() {
        let mut parent = ProcessContext::new("i-1");
        parent.set_variable("order", json!("o-1"));

        let mut branch = parent.fork("b1");
        branch.set_variable("order", json!("o-2"));
        branch.set_variable("branch_only", json!(true));

        assert_eq!(parent.variable("order"), Some(&json!("o-1")));
        assert!(!parent.has_variable("branch_only"));
        assert_eq!(branch.variable("order"), Some(&json!("o-2")));
        assert_eq!(branch.branch_id(), Some("b1"));
    }

    #[test]
    fn test_snapshot_round_trips_into_fresh_context() {
        let mut context = ProcessContext::new("i-1");
        context.set_variable("a", json!(1));
        context.set_exception(StateFailure::business("E", ""));
        context.push_frame("A", FramePhase::Forward);

        let restored = ProcessContext::from_snapshot("i-1", &context.snapshot());
        assert_eq!(restored.variable("a"), Some(&json!(1)));
        assert!(restored.exception().is_none());
        assert_eq!(restored.depth(), 0);
    }

    #[test]
    fn test_stack_frames_carry_branch() {
        let parent = ProcessContext::new("i-1");
        let mut branch = parent.fork("b2");
        branch.push_frame("Reserve", FramePhase::Forward);
        branch.push_frame("Release", FramePhase::Compensating);

        assert_eq!(branch.current_frame().unwrap().phase, FramePhase::Compensating);
        assert_eq!(branch.pop_frame().unwrap().branch_id.as_deref(), Some("b2"));
        assert_eq!(branch.depth(), 1);
    }
}
