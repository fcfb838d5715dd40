// Scripted participant used by the simulate command and the test suites

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use super::invoker::{Invocation, InvocationRequest, ServiceInvoker};
use crate::error::StateFailure;

/// One canned participant answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Ok(Value),
    Fail {
        code: String,
        #[serde(default)]
        message: String,
    },
    Pending,
}

/// Answers invocations from per-operation queues keyed by `service.method`.
/// An operation with an empty queue succeeds with `null`.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    script: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<InvocationRequest>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a script of the form `{ "service.method": [outcome, ...] }`
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let script: HashMap<String, Vec<ScriptedOutcome>> = serde_json::from_str(raw)?;
        let invoker = Self::new();
        for (operation, outcomes) in script {
            for outcome in outcomes {
                invoker.push(&operation, outcome);
            }
        }
        Ok(invoker)
    }

    pub fn push(&self, operation: &str, outcome: ScriptedOutcome) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(operation.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn fail(&self, operation: &str, code: &str) -> &Self {
        self.push(
            operation,
            ScriptedOutcome::Fail {
                code: code.to_string(),
                message: format!("{} failed", operation),
            },
        )
    }

    pub fn succeed(&self, operation: &str, output: Value) -> &Self {
        self.push(operation, ScriptedOutcome::Ok(output))
    }

    pub fn pending(&self, operation: &str) -> &Self {
        self.push(operation, ScriptedOutcome::Pending)
    }

    /// Every request received so far, in order
    pub fn calls(&self) -> Vec<InvocationRequest> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn calls_to(&self, state_name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.state_name == state_name)
            .count()
    }
}

#[async_trait]
impl ServiceInvoker for ScriptedInvoker {
    async fn invoke(&self, request: &InvocationRequest) -> Result<Invocation, StateFailure> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let operation = format!("{}.{}", request.service, request.method);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        debug!(operation = %operation, outcome = ?outcome, "Scripted invocation");

        match outcome {
            None => Ok(Invocation::Completed(Value::Null)),
            Some(ScriptedOutcome::Ok(value)) => Ok(Invocation::Completed(value)),
            Some(ScriptedOutcome::Pending) => Ok(Invocation::Pending),
            Some(ScriptedOutcome::Fail { code, message }) => Err(StateFailure::business(code, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(service: &str, method: &str) -> InvocationRequest {
        InvocationRequest {
            instance_id: "i-1".to_string(),
            state_name: "S".to_string(),
            service: service.to_string(),
            method: method.to_string(),
            input: json!({}),
            attempt: 1,
            branch_id: None,
            compensation: false,
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_consumed_in_order() {
        let invoker = ScriptedInvoker::new();
        invoker.fail("pay.execute", "Timeout").succeed("pay.execute", json!(7));

        let first = invoker.invoke(&request("pay", "execute")).await;
        assert_eq!(first.unwrap_err().code, "Timeout");
        let second = invoker.invoke(&request("pay", "execute")).await.unwrap();
        assert_eq!(second, Invocation::Completed(json!(7)));
        let third = invoker.invoke(&request("pay", "execute")).await.unwrap();
        assert_eq!(third, Invocation::Completed(Value::Null));
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_script_from_json() {
        let invoker = ScriptedInvoker::from_json(
            r#"{ "ship.execute": ["pending", { "fail": { "code": "Lost" } }] }"#,
        )
        .unwrap();

        let first = invoker.invoke(&request("ship", "execute")).await.unwrap();
        assert_eq!(first, Invocation::Pending);
        let second = invoker.invoke(&request("ship", "execute")).await.unwrap_err();
        assert_eq!(second.code, "Lost");
        assert_eq!(second.message, "");
    }
}
