// Error taxonomy for the saga engine
//
// Business failures raised by participants travel as `StateFailure` values and
// are converted into routing decisions. Everything that escapes a traversal is
// an `EngineError`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::WorkerPoolError;
use crate::statelang::DefinitionError;
use crate::store::PersistenceError;

/// Where a state failure originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by the participant's own business logic
    Business,
    /// Injected by an external cancellation request at a state boundary
    Cancelled,
    /// Framework fault (missing state, corrupted context)
    Execution,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Business => f.write_str("business"),
            FailureKind::Cancelled => f.write_str("cancelled"),
            FailureKind::Execution => f.write_str("execution"),
        }
    }
}

/// The in-flight failure of a state, held by the process context while the
/// traversal is on an error-handling path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} failure [{code}]: {message}")]
pub struct StateFailure {
    pub kind: FailureKind,
    /// Matched against retry and catch rules
    pub code: String,
    pub message: String,
    /// State that raised the failure, filled in by the executor when absent
    pub state_name: Option<String>,
}

impl StateFailure {
    pub fn business(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Business,
            code: code.into(),
            message: message.into(),
            state_name: None,
        }
    }

    pub fn cancelled(state_name: &str) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            code: "Cancelled".to_string(),
            message: format!("cancellation requested before state '{}'", state_name),
            state_name: Some(state_name.to_string()),
        }
    }

    pub fn execution(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            code: code.into(),
            message: message.into(),
            state_name: None,
        }
    }

    pub fn in_state(mut self, state_name: &str) -> Self {
        if self.state_name.is_none() {
            self.state_name = Some(state_name.to_string());
        }
        self
    }
}

/// Errors surfaced to callers of the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller misuse, e.g. a second terminal write. Never swallowed internally.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Engine execution error in instance {instance_id}: {reason}")]
    Execution { instance_id: String, reason: String },

    #[error("State machine definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Invalid state machine definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("State machine instance not found: {0}")]
    InstanceNotFound(String),

    #[error("State machine instance {0} is already being traversed")]
    InstanceLocked(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] WorkerPoolError),
}

impl EngineError {
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, EngineError::IllegalState(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
