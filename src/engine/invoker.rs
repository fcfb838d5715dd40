use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StateFailure;

/// What the engine asks a participant to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub instance_id: String,
    pub state_name: String,
    pub service: String,
    pub method: String,
    pub input: Value,
    pub attempt: u32,
    pub branch_id: Option<String>,
    /// True when undoing a forward state
    pub compensation: bool,
}

/// Participant answer
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed(Value),
    /// Accepted but answered later through `SagaEngine::complete_async`
    Pending,
}

/// Seam to the transport that actually reaches remote participants
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> Result<Invocation, StateFailure>;
}
