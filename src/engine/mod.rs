// Saga engine: owns the collaborators of a traversal and the lifecycle of
// the config change listener's worker pool.

pub mod executor;
pub mod invoker;
pub mod lock;
pub mod phase;
pub mod scripted;

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn, Instrument};

use crate::config::{ConfigHandle, EngineConfig, EngineConfigListener};
use crate::domain::{RecordStatus, StateExecutionRecord, StateMachineInstance};
use crate::error::{EngineError, EngineResult, StateFailure};
use crate::proctrl::ProcessContext;
use crate::statelang::{DefinitionProvider, StateMachine};
use crate::store::{InMemoryInstanceRepository, InstanceRepository};
use crate::strategy::StatusDecisionStrategy;
use crate::telemetry::{create_traversal_span, generate_correlation_id};

use executor::{Step, Traversal};

pub use invoker::{Invocation, InvocationRequest, ServiceInvoker};
pub use lock::{InstanceLease, InstanceLockRegistry};
pub use phase::{Phase, PhaseEvent, TraversalPhase};
pub use scripted::{ScriptedInvoker, ScriptedOutcome};

/// Collaborators shared by every traversal of one engine
pub(crate) struct EngineShared {
    pub(crate) config: ConfigHandle,
    pub(crate) strategy: Arc<dyn StatusDecisionStrategy>,
    pub(crate) invoker: Arc<dyn ServiceInvoker>,
    pub(crate) repository: Arc<dyn InstanceRepository>,
    pub(crate) definitions: Arc<dyn DefinitionProvider>,
    pub(crate) locks: InstanceLockRegistry,
    cancellations: Mutex<HashSet<String>>,
}

impl EngineShared {
    /// Consume a pending cancellation request for an instance
    pub(crate) fn take_cancellation(&self, instance_id: &str) -> bool {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(instance_id)
    }

    fn resolve(&self, machine_name: &str) -> EngineResult<Arc<StateMachine>> {
        self.definitions
            .definition(machine_name)
            .ok_or_else(|| EngineError::DefinitionNotFound(machine_name.to_string()))
    }
}

#[derive(Default)]
pub struct SagaEngineBuilder {
    config: Option<ConfigHandle>,
    strategy: Option<Arc<dyn StatusDecisionStrategy>>,
    invoker: Option<Arc<dyn ServiceInvoker>>,
    repository: Option<Arc<dyn InstanceRepository>>,
    definitions: Option<Arc<dyn DefinitionProvider>>,
}

impl SagaEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(ConfigHandle::new(config));
        self
    }

    /// Share an existing handle, e.g. one already fed by a config source
    pub fn config_handle(mut self, handle: ConfigHandle) -> Self {
        self.config = Some(handle);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn StatusDecisionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn ServiceInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn InstanceRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn definitions(mut self, definitions: Arc<dyn DefinitionProvider>) -> Self {
        self.definitions = Some(definitions);
        self
    }

    pub fn build(self) -> EngineResult<SagaEngine> {
        let invoker = self
            .invoker
            .ok_or_else(|| EngineError::IllegalState("no service invoker configured".to_string()))?;
        let definitions = self
            .definitions
            .ok_or_else(|| EngineError::IllegalState("no definition provider configured".to_string()))?;
        let config = self.config.unwrap_or_default();
        let strategy = self
            .strategy
            .unwrap_or_else(|| crate::strategy::from_config(&config));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryInstanceRepository::new()));

        Ok(SagaEngine {
            shared: Arc::new(EngineShared {
                config,
                strategy,
                invoker,
                repository,
                definitions,
                locks: InstanceLockRegistry::new(),
                cancellations: Mutex::new(HashSet::new()),
            }),
            listener: Mutex::new(None),
        })
    }
}

/// Entry point for starting, resuming and cancelling saga instances.
///
/// Traversals are only accepted between `start` and `stop`.
pub struct SagaEngine {
    shared: Arc<EngineShared>,
    listener: Mutex<Option<Arc<EngineConfigListener>>>,
}

impl SagaEngine {
    pub fn builder() -> SagaEngineBuilder {
        SagaEngineBuilder::default()
    }

    /// Start the config change listener and its dedicated worker pool
    pub fn start(&self) -> EngineResult<()> {
        let mut listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listener.is_some() {
            return Ok(());
        }
        let settings = self.shared.config.get().listener.clone();
        let created = EngineConfigListener::new(self.shared.config.clone(), &settings)?;
        *listener = Some(Arc::new(created));
        info!(threads = settings.worker_threads, "Saga engine started");
        Ok(())
    }

    /// Stop the listener pool. Traversals already running are not interrupted.
    pub fn stop(&self) {
        let stopped = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(listener) = stopped {
            listener.stop();
            info!("Saga engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Listener to register with a configuration source
    pub fn config_listener(&self) -> Option<Arc<EngineConfigListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.shared.config
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if !self.is_running() {
            return Err(EngineError::IllegalState("saga engine is not started".to_string()));
        }
        Ok(())
    }

    /// Create an instance of `machine_name` and traverse it until it ends or
    /// suspends on an asynchronous participant
    pub async fn execute(
        &self,
        machine_name: &str,
        business_key: Option<String>,
        params: Value,
    ) -> EngineResult<StateMachineInstance> {
        self.ensure_running()?;
        let definition = self.shared.resolve(machine_name)?;

        let mut instance = StateMachineInstance::new(machine_name, business_key, &definition.start_state);
        let mut context = ProcessContext::new(&instance.id);
        if let Value::Object(map) = params {
            context.extend_variables(map);
        }
        instance.context_snapshot = context.snapshot();
        self.shared.repository.create(&instance).await?;
        let _lease = self.shared.locks.try_acquire(&instance.id)?;

        let span = create_traversal_span(machine_name, &instance.id, &generate_correlation_id());
        info!(instance_id = %instance.id, machine = %machine_name, "Starting state machine");
        Traversal::new(Arc::clone(&self.shared), definition, instance, context)
            .run(None)
            .instrument(span)
            .await
    }

    /// Deliver the answer of an asynchronous participant and continue the
    /// traversal from the suspended state
    pub async fn complete_async(
        &self,
        instance_id: &str,
        state_name: &str,
        result: Result<Value, StateFailure>,
    ) -> EngineResult<StateMachineInstance> {
        self.ensure_running()?;
        let _lease = self.shared.locks.try_acquire(instance_id)?;
        let instance = self.load_running(instance_id).await?;
        let definition = self.shared.resolve(&instance.machine_name)?;

        let pending = instance
            .latest_forward_record(state_name, None)
            .filter(|record| record.status == RecordStatus::Unknown)
            .cloned();
        let (Some(pending), true) = (pending, instance.current_state == state_name) else {
            return Err(EngineError::IllegalState(format!(
                "instance {} has no pending invocation of state '{}'",
                instance_id, state_name
            )));
        };
        let Some(task) = definition.task(state_name).cloned() else {
            return Err(EngineError::IllegalState(format!("state '{}' is not a task", state_name)));
        };

        let context = ProcessContext::from_snapshot(instance_id, &instance.context_snapshot);
        let span = create_traversal_span(&instance.machine_name, instance_id, &generate_correlation_id());
        let mut traversal = Traversal::new(Arc::clone(&self.shared), definition, instance, context);

        let resume = async move {
            let first = match result {
                Ok(output) => {
                    let record = StateExecutionRecord::forward(
                        state_name,
                        pending.input.clone(),
                        task.is_for_update,
                        pending.attempt,
                    )
                    .succeeded(output.clone());
                    traversal.record(record).await?;
                    traversal.complete_task(state_name, &task, output)
                }
                Err(failure) => traversal.handle_failure(failure.in_state(state_name), false).await,
            };
            match first {
                Ok(step) => traversal.run(Some(step)).await,
                Err(EngineError::Execution { instance_id, reason }) => {
                    traversal.abort(state_name, &reason).await;
                    Err(EngineError::Execution { instance_id, reason })
                }
                Err(e) => Err(e),
            }
        };
        info!(instance_id = %instance_id, state = %state_name, "Resuming after asynchronous completion");
        resume.instrument(span).await
    }

    /// Continue a running instance from its persisted cursor, e.g. after the
    /// process that owned it went away
    pub async fn resume(&self, instance_id: &str) -> EngineResult<StateMachineInstance> {
        self.ensure_running()?;
        let _lease = self.shared.locks.try_acquire(instance_id)?;
        let instance = self.load_running(instance_id).await?;
        let definition = self.shared.resolve(&instance.machine_name)?;

        if instance
            .latest_forward_record(&instance.current_state, None)
            .is_some_and(|record| record.status == RecordStatus::Unknown)
        {
            return Err(EngineError::IllegalState(format!(
                "instance {} awaits an asynchronous answer for state '{}'",
                instance_id, instance.current_state
            )));
        }

        // a task whose success was recorded before the cursor moved on is
        // not invoked again; its output is replayed from the record
        let cursor = instance.current_state.clone();
        let completed = instance
            .records()
            .iter()
            .rev()
            .find(|record| record.is_forward() && record.branch_id.is_none())
            .filter(|record| record.state_name == cursor && record.status == RecordStatus::Succeeded)
            .map(|record| record.output.clone().unwrap_or(Value::Null));
        let task = definition.task(&cursor).cloned();

        let context = ProcessContext::from_snapshot(instance_id, &instance.context_snapshot);
        let span = create_traversal_span(&instance.machine_name, instance_id, &generate_correlation_id());
        let mut traversal = Traversal::new(Arc::clone(&self.shared), definition, instance, context);

        info!(instance_id = %instance_id, state = %cursor, "Resuming instance");
        let resume = async move {
            let first = match (completed, task) {
                (Some(output), Some(task)) => {
                    info!(instance_id = %instance_id, state = %cursor, "Replaying recorded task output");
                    match traversal.complete_task(&cursor, &task, output) {
                        Ok(step) => Some(step),
                        Err(EngineError::Execution { instance_id, reason }) => {
                            traversal.abort(&cursor, &reason).await;
                            return Err(EngineError::Execution { instance_id, reason });
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => None,
            };
            traversal.run(first).await
        };
        resume.instrument(span).await
    }

    /// Request cancellation. It takes effect at the next state boundary of a
    /// running traversal, or of the next resume.
    pub async fn cancel(&self, instance_id: &str) -> EngineResult<()> {
        let instance = self.load_running(instance_id).await?;
        self.shared
            .cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(instance.id.clone());
        warn!(instance_id = %instance_id, "Cancellation requested");
        Ok(())
    }

    pub async fn instance(&self, instance_id: &str) -> EngineResult<Option<StateMachineInstance>> {
        Ok(self.shared.repository.load(instance_id).await?)
    }

    async fn load_running(&self, instance_id: &str) -> EngineResult<StateMachineInstance> {
        let instance = self
            .shared
            .repository
            .load(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if instance.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "instance {} already finished with status {}",
                instance_id, instance.status
            )));
        }
        Ok(instance)
    }
}

impl Drop for SagaEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionStatus;
    use crate::statelang::InMemoryDefinitionProvider;
    use crate::store::MockInstanceRepository;
    use serde_json::json;

    fn definitions() -> Arc<InMemoryDefinitionProvider> {
        let provider = Arc::new(InMemoryDefinitionProvider::new());
        provider
            .register_json(
                &json!({
                    "name": "single",
                    "start_state": "Work",
                    "states": {
                        "Work": { "type": "Task", "service": "worker", "next": "Done" },
                        "Done": { "type": "Succeed" }
                    }
                })
                .to_string(),
            )
            .unwrap();
        provider
    }

    fn engine(repository: Arc<dyn InstanceRepository>, invoker: Arc<ScriptedInvoker>) -> SagaEngine {
        let engine = SagaEngine::builder()
            .definitions(definitions())
            .invoker(invoker)
            .repository(repository)
            .build()
            .unwrap();
        engine.start().unwrap();
        engine
    }

    #[tokio::test]
    async fn test_lost_terminal_race_is_illegal_state() {
        let mut repository = MockInstanceRepository::new();
        repository.expect_create().times(1).returning(|_| Ok(()));
        repository.expect_append_record().times(1).returning(|_, _| Ok(()));
        repository.expect_save_progress().returning(|_, _, _| Ok(()));
        repository
            .expect_compare_and_swap_status()
            .times(1)
            .withf(|_, expected, update| {
                *expected == ExecutionStatus::Running && update.status == ExecutionStatus::Succeeded
            })
            .returning(|_, _, _| Ok(false));

        let engine = engine(Arc::new(repository), Arc::new(ScriptedInvoker::new()));
        let err = engine.execute("single", None, json!({})).await.unwrap_err();

        assert!(err.is_illegal_state());
    }

    #[tokio::test]
    async fn test_leased_instance_rejects_second_traversal() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.pending("worker.execute");
        let engine = engine(Arc::new(InMemoryInstanceRepository::new()), invoker);

        let suspended = engine.execute("single", None, json!({})).await.unwrap();
        assert_eq!(suspended.status, ExecutionStatus::Running);

        let lease = engine.shared.locks.try_acquire(&suspended.id).unwrap();
        let err = engine
            .complete_async(&suspended.id, "Work", Ok(json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstanceLocked(_)));

        drop(lease);
        let finished = engine
            .complete_async(&suspended.id, "Work", Ok(json!(1)))
            .await
            .unwrap();
        assert_eq!(finished.status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_resume_refuses_pending_instance() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.pending("worker.execute");
        let engine = engine(Arc::new(InMemoryInstanceRepository::new()), invoker);

        let suspended = engine.execute("single", None, json!({})).await.unwrap();
        let err = engine.resume(&suspended.id).await.unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[tokio::test]
    async fn test_unused_cancellation_is_dropped_when_instance_ends() {
        let invoker = Arc::new(ScriptedInvoker::new());
        invoker.pending("worker.execute");
        let engine = engine(Arc::new(InMemoryInstanceRepository::new()), invoker);

        let suspended = engine.execute("single", None, json!({})).await.unwrap();
        engine.cancel(&suspended.id).await.unwrap();
        assert_eq!(engine.shared.cancellations.lock().unwrap().len(), 1);

        let finished = engine
            .complete_async(&suspended.id, "Work", Ok(json!(1)))
            .await
            .unwrap();

        assert_eq!(finished.current_state, "Done");
        assert_eq!(finished.status, ExecutionStatus::Succeeded);
        assert!(engine.shared.cancellations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_instance() {
        let engine = engine(Arc::new(InMemoryInstanceRepository::new()), Arc::new(ScriptedInvoker::new()));
        assert!(matches!(
            engine.cancel("missing").await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }
}
