// Durable facts of a saga: instances and their causally ordered execution records

pub mod instance;
pub mod record;

pub use instance::{ExecutionStatus, StateMachineInstance};
pub use record::{FailureSummary, RecordKind, RecordStatus, StateExecutionRecord};
