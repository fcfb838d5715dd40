// Saga Engine Library - state machine orchestration with compensation
// This exposes the core components for embedding and integration testing

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod proctrl;
pub mod statelang;
pub mod store;
pub mod strategy;
pub mod telemetry;

// Re-export key types for easy access
pub use crate::config::{
    ConfigChangeListener, ConfigHandle, ConfigNotifier, EngineConfig, EngineConfigListener, WorkerPool,
};
pub use domain::{ExecutionStatus, RecordKind, RecordStatus, StateExecutionRecord, StateMachineInstance};
pub use engine::{
    Invocation, InvocationRequest, SagaEngine, SagaEngineBuilder, ScriptedInvoker, ScriptedOutcome,
    ServiceInvoker,
};
pub use error::{EngineError, EngineResult, FailureKind, StateFailure};
pub use proctrl::ProcessContext;
pub use statelang::{DefinitionProvider, InMemoryDefinitionProvider, StateMachine};
pub use store::{InMemoryInstanceRepository, InstanceRepository, PersistenceError};
pub use strategy::{
    AlwaysCompensateStrategy, CompensationFailurePolicy, DefaultStatusDecisionStrategy, StatusDecisionStrategy,
};
pub use telemetry::{create_traversal_span, generate_correlation_id, init_telemetry};
