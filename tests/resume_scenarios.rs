// Resuming instances whose owning traversal stopped between two writes

use async_trait::async_trait;
use saga_engine::domain::{ExecutionStatus, RecordStatus, StateExecutionRecord, StateMachineInstance};
use saga_engine::store::{InMemoryInstanceRepository, InstanceRepository, PersistenceError, TerminalUpdate};
use saga_engine::{EngineError, InMemoryDefinitionProvider, SagaEngine, ScriptedInvoker};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

/// In-memory repository that refuses the cursor move into one state, once
struct FlakyProgressRepository {
    inner: InMemoryInstanceRepository,
    fail_on_state: Mutex<Option<String>>,
    created: Mutex<Vec<String>>,
}

impl FlakyProgressRepository {
    fn failing_once_on(state: &str) -> Self {
        Self {
            inner: InMemoryInstanceRepository::new(),
            fail_on_state: Mutex::new(Some(state.to_string())),
            created: Mutex::new(Vec::new()),
        }
    }

    fn last_created(&self) -> String {
        self.created.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl InstanceRepository for FlakyProgressRepository {
    async fn create(&self, instance: &StateMachineInstance) -> Result<(), PersistenceError> {
        self.created.lock().unwrap().push(instance.id.clone());
        self.inner.create(instance).await
    }

    async fn append_record(
        &self,
        instance_id: &str,
        record: &StateExecutionRecord,
    ) -> Result<(), PersistenceError> {
        self.inner.append_record(instance_id, record).await
    }

    async fn load(&self, instance_id: &str) -> Result<Option<StateMachineInstance>, PersistenceError> {
        self.inner.load(instance_id).await
    }

    async fn save_progress(
        &self,
        instance_id: &str,
        current_state: &str,
        context_snapshot: &Value,
    ) -> Result<(), PersistenceError> {
        let fail = {
            let mut armed = self.fail_on_state.lock().unwrap();
            if armed.as_deref() == Some(current_state) {
                armed.take();
                true
            } else {
                false
            }
        };
        if fail {
            return Err(PersistenceError::Unavailable("connection reset".to_string()));
        }
        self.inner.save_progress(instance_id, current_state, context_snapshot).await
    }

    async fn compare_and_swap_status(
        &self,
        instance_id: &str,
        expected: ExecutionStatus,
        update: &TerminalUpdate,
    ) -> Result<bool, PersistenceError> {
        self.inner.compare_and_swap_status(instance_id, expected, update).await
    }
}

fn checkout_definition() -> Value {
    json!({
        "name": "checkout",
        "start_state": "Charge",
        "states": {
            "Charge": { "type": "Task", "service": "card", "method": "charge", "is_for_update": true,
                        "compensate_state": "Void", "output_key": "charge", "next": "Route" },
            "Route": { "type": "Choice",
                       "choices": [{ "variable": "express", "equals": true, "next": "Ship" }],
                       "default": "Notify" },
            "Ship": { "type": "Task", "service": "courier", "method": "ship", "next": "Notify" },
            "Notify": { "type": "Task", "service": "mail", "method": "send", "next": "Done" },
            "Void": { "type": "Task", "service": "card", "method": "void" },
            "Done": { "type": "Succeed" }
        }
    })
}

fn engine_with(repository: Arc<FlakyProgressRepository>, invoker: Arc<ScriptedInvoker>) -> SagaEngine {
    let definitions = Arc::new(InMemoryDefinitionProvider::new());
    definitions
        .register_json(&checkout_definition().to_string())
        .unwrap();
    let engine = SagaEngine::builder()
        .definitions(definitions)
        .invoker(invoker)
        .repository(repository)
        .build()
        .unwrap();
    engine.start().unwrap();
    engine
}

#[tokio::test]
async fn test_resume_does_not_repeat_recorded_update() {
    let repository = Arc::new(FlakyProgressRepository::failing_once_on("Route"));
    let invoker = Arc::new(ScriptedInvoker::new());
    invoker.succeed("card.charge", json!({ "auth": "A-7" }));
    let engine = engine_with(repository.clone(), invoker.clone());

    let err = engine
        .execute("checkout", None, json!({ "express": true }))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));

    let id = repository.last_created();
    let stored = repository.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Running);
    assert_eq!(stored.current_state, "Charge");

    let finished = engine.resume(&id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(invoker.calls_to("Charge"), 1);
    assert_eq!(invoker.calls_to("Ship"), 1);
    let charges: Vec<_> = finished
        .records()
        .iter()
        .filter(|r| r.state_name == "Charge")
        .map(|r| r.status)
        .collect();
    assert_eq!(charges, vec![RecordStatus::Succeeded]);

    let ship = invoker
        .calls()
        .into_iter()
        .find(|call| call.state_name == "Ship")
        .unwrap();
    assert_eq!(ship.input["charge"], json!({ "auth": "A-7" }));
}

#[tokio::test]
async fn test_resume_continues_from_saved_cursor() {
    let repository = Arc::new(FlakyProgressRepository::failing_once_on("Notify"));
    let invoker = Arc::new(ScriptedInvoker::new());
    let engine = engine_with(repository.clone(), invoker.clone());

    let err = engine.execute("checkout", None, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));

    let id = repository.last_created();
    let stored = repository.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.current_state, "Route");

    let finished = engine.resume(&id).await.unwrap();

    assert_eq!(finished.status, ExecutionStatus::Succeeded);
    assert_eq!(invoker.calls_to("Charge"), 1);
    assert_eq!(invoker.calls_to("Ship"), 0);
    assert_eq!(invoker.calls_to("Notify"), 1);

    let stored = repository.load(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Succeeded);
    assert!(engine.resume(&id).await.unwrap_err().is_illegal_state());
}
