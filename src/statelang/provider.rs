use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use super::{DefinitionError, StateMachine};

/// Source of immutable state machine definitions, resolved once per traversal start
pub trait DefinitionProvider: Send + Sync {
    fn definition(&self, name: &str) -> Option<Arc<StateMachine>>;
}

/// Definitions registered in memory, validated on registration
#[derive(Debug, Default)]
pub struct InMemoryDefinitionProvider {
    definitions: RwLock<HashMap<String, Arc<StateMachine>>>,
}

impl InMemoryDefinitionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a definition. Running traversals keep the graph
    /// they resolved at start.
    pub fn register(&self, machine: StateMachine) -> Result<Arc<StateMachine>, DefinitionError> {
        machine.validate()?;
        let machine = Arc::new(machine);
        info!(machine = %machine.name, states = machine.states.len(), "Registered state machine definition");
        self.definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(machine.name.clone(), Arc::clone(&machine));
        Ok(machine)
    }

    pub fn register_json(&self, raw: &str) -> Result<Arc<StateMachine>, DefinitionError> {
        self.register(StateMachine::from_json(raw)?)
    }
}

impl DefinitionProvider for InMemoryDefinitionProvider {
    fn definition(&self, name: &str) -> Option<Arc<StateMachine>> {
        self.definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}
