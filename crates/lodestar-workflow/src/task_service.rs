//! Task execution service: owns the task state machine, persists every
//! transition and dispatches work to executors or the task queue.

use crate::context::ExecutionContext;
use crate::definition::{DefinitionRegistry, ExecutionMode, TaskDefinition};
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventPublisher, TaskEventKind};
use crate::executor::ExecutorRegistry;
use crate::queue::{MessageQueue, TaskMessage};
use crate::retry::BackoffPolicy;
use crate::state::{TaskExecution, TaskExecutionId, TaskStatus, WorkflowExecution, WorkflowStatus};
use crate::store::ExecutionStore;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Converts executor outputs to the persisted string map. String values
/// are stored raw; everything else keeps its JSON rendering.
fn stringify_outputs(outputs: HashMap<String, Value>) -> HashMap<String, String> {
    outputs
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect()
}

/// Service owning task execution lifecycles.
pub struct TaskExecutionService {
    store: ExecutionStore,
    definitions: Arc<DefinitionRegistry>,
    executors: Arc<ExecutorRegistry>,
    publisher: EventPublisher,
    backoff: BackoffPolicy,
    dispatch: MessageQueue,
    local_permits: Arc<Semaphore>,
}

impl TaskExecutionService {
    /// Creates a task service.
    pub fn new(
        store: ExecutionStore,
        definitions: Arc<DefinitionRegistry>,
        executors: Arc<ExecutorRegistry>,
        publisher: EventPublisher,
        backoff: BackoffPolicy,
        dispatch: MessageQueue,
        pool_size: usize,
    ) -> Self {
        Self {
            store,
            definitions,
            executors,
            publisher,
            backoff,
            dispatch,
            local_permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Access to the backing store.
    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    /// Creates and persists a `Pending` task execution under a running
    /// workflow.
    pub async fn create(
        &self,
        workflow: &WorkflowExecution,
        definition: &TaskDefinition,
        inputs: HashMap<String, String>,
    ) -> WorkflowResult<TaskExecution> {
        if workflow.status != WorkflowStatus::Running {
            return Err(WorkflowError::Validation(format!(
                "cannot create task '{}' while workflow {} is {}",
                definition.name, workflow.id, workflow.status
            )));
        }

        let task = TaskExecution::new(workflow.id, definition, inputs);
        self.store.insert_task(task.clone()).await?;
        self.publisher
            .task(TaskEventKind::Created, &task, &workflow.correlation_id);
        Ok(task)
    }

    /// Runs one attempt of a `Pending` or `AwaitingRetry` task.
    ///
    /// Local tasks invoke their executor on the bounded worker pool and
    /// return a terminal outcome; queued tasks publish a [`TaskMessage`]
    /// and return immediately with the task left `Running`.
    pub async fn execute(&self, task_id: TaskExecutionId) -> WorkflowResult<TaskStatus> {
        let task = self.store.task(task_id).await?;
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::AwaitingRetry) {
            return Err(WorkflowError::InvalidStateTransition {
                from: task.status.to_string(),
                to: TaskStatus::Running.to_string(),
            });
        }

        let workflow = self.store.workflow(task.workflow_execution_id).await?;
        let definition = self.definitions.get(workflow.definition_id).await?;
        let task_def = definition
            .task(task.task_definition_id)
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("Task definition {}", task.task_definition_id))
            })?
            .clone();

        match task_def.execution_mode {
            ExecutionMode::Queued => {
                let task = self.start_attempt(task_id, &workflow).await?;

                let message = TaskMessage {
                    task_execution_id: task.id,
                    task_type: task_def.task_type.clone(),
                    inputs: task.inputs.clone(),
                    configuration: task_def.configuration.clone(),
                };
                let payload = serde_json::to_string(&message)?;
                if let Err(e) = self.dispatch.publish(payload) {
                    // Dispatch failure counts against the retry budget
                    return self.fail(task_id, e.to_string()).await;
                }

                debug!(
                    "Queued task '{}' ({}) on {}",
                    task.name,
                    task.id,
                    self.dispatch.name()
                );
                Ok(TaskStatus::Running)
            }
            ExecutionMode::Local => {
                let executor = self
                    .executors
                    .get(&task_def.task_type)
                    .ok_or_else(|| WorkflowError::NoExecutor(task_def.task_type.clone()))?;

                let task = self.start_attempt(task_id, &workflow).await?;

                let permit = self
                    .local_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkflowError::Internal("worker pool closed".to_string()))?;

                let mut context = ExecutionContext::from_variables(workflow.variables.clone());
                context.merge(&task.inputs);

                let result = match task_def.timeout_seconds {
                    Some(secs) => {
                        match timeout(
                            Duration::from_secs(secs),
                            executor.execute(&task_def, &context),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(WorkflowError::ExecutionTimeout(secs)),
                        }
                    }
                    None => executor.execute(&task_def, &context).await,
                };
                drop(permit);

                match result {
                    Ok(outputs) => self.complete(task_id, outputs).await,
                    Err(e) if e.is_fatal() => self.fail_terminal(task_id, e.to_string()).await,
                    Err(e) => self.fail(task_id, e.to_string()).await,
                }
            }
        }
    }

    async fn start_attempt(
        &self,
        task_id: TaskExecutionId,
        workflow: &WorkflowExecution,
    ) -> WorkflowResult<TaskExecution> {
        let task = self.store.update_task(task_id, |t| t.start()).await?;
        self.publisher
            .task(TaskEventKind::Started, &task, &workflow.correlation_id);
        Ok(task)
    }

    /// Completes a task, merging its outputs.
    ///
    /// Results for a cancelled workflow are discarded; completions for a
    /// task no longer in flight are stale notifications and are dropped.
    pub async fn complete(
        &self,
        task_id: TaskExecutionId,
        outputs: HashMap<String, Value>,
    ) -> WorkflowResult<TaskStatus> {
        let task = self.store.task(task_id).await?;
        let workflow = self.store.workflow(task.workflow_execution_id).await?;

        if workflow.status == WorkflowStatus::Cancelled {
            return self.discard(task).await;
        }
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Pending) {
            warn!(
                "Stale completion for task {} in status {}, dropping",
                task_id, task.status
            );
            return Ok(task.status);
        }

        let rendered = stringify_outputs(outputs);
        let task = self
            .store
            .update_task(task_id, |t| t.complete(rendered))
            .await?;
        self.publisher
            .task(TaskEventKind::Completed, &task, &workflow.correlation_id);
        Ok(TaskStatus::Completed)
    }

    /// Fails a task attempt, entering the retry loop while budget remains.
    pub async fn fail(
        &self,
        task_id: TaskExecutionId,
        error: impl Into<String>,
    ) -> WorkflowResult<TaskStatus> {
        let error = error.into();
        let task = self.store.task(task_id).await?;
        let workflow = self.store.workflow(task.workflow_execution_id).await?;

        if workflow.status == WorkflowStatus::Cancelled {
            return self.discard(task).await;
        }
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Pending) {
            warn!(
                "Stale failure for task {} in status {}, dropping",
                task_id, task.status
            );
            return Ok(task.status);
        }

        let definition = self.definitions.get(workflow.definition_id).await?;
        let retry_limit = definition
            .task(task.task_definition_id)
            .map(|d| d.retry_limit)
            .unwrap_or(self.backoff.max_attempts);

        if task.retry_count < retry_limit {
            let next_retry_at = self.backoff.next_retry_at(task.retry_count);
            let task = self
                .store
                .update_task(task_id, |t| t.await_retry(error.clone(), next_retry_at))
                .await?;
            let event_task = task.clone();
            self.publisher.publish(crate::events::OrchestratorEvent::Task(
                crate::events::TaskEvent::new(
                    TaskEventKind::RetryScheduled,
                    &event_task,
                    &workflow.correlation_id,
                )
                .with_attribute("nextRetryAt", next_retry_at.to_rfc3339()),
            ));
            Ok(TaskStatus::AwaitingRetry)
        } else {
            let task = self.store.update_task(task_id, |t| t.fail(error.clone())).await?;
            self.publisher
                .task(TaskEventKind::Failed, &task, &workflow.correlation_id);
            Ok(TaskStatus::Failed)
        }
    }

    /// Fails a task terminally, bypassing the retry budget. Used for
    /// validation and configuration errors.
    pub async fn fail_terminal(
        &self,
        task_id: TaskExecutionId,
        error: impl Into<String>,
    ) -> WorkflowResult<TaskStatus> {
        let error = error.into();
        let task = self.store.task(task_id).await?;
        let workflow = self.store.workflow(task.workflow_execution_id).await?;

        if workflow.status == WorkflowStatus::Cancelled {
            return self.discard(task).await;
        }
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Pending) {
            warn!(
                "Stale failure for task {} in status {}, dropping",
                task_id, task.status
            );
            return Ok(task.status);
        }

        let task = self.store.update_task(task_id, |t| t.fail(error.clone())).await?;
        self.publisher
            .task(TaskEventKind::Failed, &task, &workflow.correlation_id);
        Ok(TaskStatus::Failed)
    }

    /// Skips a `Pending` task.
    pub async fn skip(&self, task_id: TaskExecutionId) -> WorkflowResult<TaskStatus> {
        let task = self.store.task(task_id).await?;
        let workflow = self.store.workflow(task.workflow_execution_id).await?;

        let task = self.store.update_task(task_id, |t| t.skip()).await?;
        self.publisher
            .task(TaskEventKind::Skipped, &task, &workflow.correlation_id);
        Ok(TaskStatus::Skipped)
    }

    /// Tasks whose retry is due at `now`.
    pub async fn tasks_to_retry(&self, now: DateTime<Utc>) -> Vec<TaskExecution> {
        self.store.tasks_to_retry(now).await
    }

    /// Resets an `AwaitingRetry` task to `Pending` for its next attempt,
    /// keeping the retry counter.
    pub async fn reset_for_retry(
        &self,
        task_id: TaskExecutionId,
    ) -> WorkflowResult<TaskExecution> {
        self.store
            .update_task(task_id, |t| {
                if t.status != TaskStatus::AwaitingRetry {
                    return Err(WorkflowError::InvalidStateTransition {
                        from: t.status.to_string(),
                        to: TaskStatus::Pending.to_string(),
                    });
                }
                t.reset_for_retry()
            })
            .await
    }

    /// Resets a task for a subset re-run: state cleared, retry counter
    /// preserved.
    pub async fn reset_for_rerun(
        &self,
        task_id: TaskExecutionId,
    ) -> WorkflowResult<TaskExecution> {
        self.store
            .update_task(task_id, |t| {
                t.reset_full(false);
                Ok(())
            })
            .await
    }

    /// Resets a task for an explicit restart: state and retry counter
    /// cleared.
    pub async fn restart(&self, task_id: TaskExecutionId) -> WorkflowResult<TaskExecution> {
        self.store
            .update_task(task_id, |t| {
                t.reset_full(true);
                Ok(())
            })
            .await
    }

    /// Discards a late result for a cancelled workflow: no events, no
    /// output merge.
    async fn discard(&self, task: TaskExecution) -> WorkflowResult<TaskStatus> {
        debug!(
            "Discarding result for task {} of cancelled workflow {}",
            task.id, task.workflow_execution_id
        );
        if !task.status.is_terminal() {
            self.store.update_task(task.id, |t| t.cancel()).await?;
        }
        Ok(TaskStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::context::ExecutionContext;
    use crate::definition::{StrategyType, WorkflowDefinition};
    use crate::executor::{TaskExecutor, SUCCESS_KEY};
    use async_trait::async_trait;
    use lodestar_events::EventBus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyExecutor {
        calls: AtomicU32,
        failures: u32,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl TaskExecutor for FlakyExecutor {
        fn task_type(&self) -> &str {
            "flaky"
        }

        async fn execute(
            &self,
            definition: &TaskDefinition,
            _context: &ExecutionContext,
        ) -> WorkflowResult<HashMap<String, Value>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(WorkflowError::TaskExecutionFailed {
                    task: definition.name.clone(),
                    reason: "boom".to_string(),
                });
            }
            let mut outputs = HashMap::new();
            outputs.insert(SUCCESS_KEY.to_string(), Value::Bool(true));
            Ok(outputs)
        }
    }

    struct Fixture {
        service: TaskExecutionService,
        store: ExecutionStore,
        definitions: Arc<DefinitionRegistry>,
        dispatch: MessageQueue,
    }

    async fn fixture(executor: Arc<dyn TaskExecutor>) -> Fixture {
        let store = ExecutionStore::new();
        let definitions = Arc::new(DefinitionRegistry::new());
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(executor);
        let publisher = EventPublisher::new(EventBus::new(), EventsConfig::default());
        let dispatch = MessageQueue::new(crate::queue::TASK_DISPATCH_QUEUE);

        let service = TaskExecutionService::new(
            store.clone(),
            Arc::clone(&definitions),
            executors,
            publisher,
            BackoffPolicy::default(),
            dispatch.clone(),
            4,
        );

        Fixture {
            service,
            store,
            definitions,
            dispatch,
        }
    }

    async fn running_workflow(
        fixture: &Fixture,
        task: TaskDefinition,
    ) -> (WorkflowExecution, TaskDefinition) {
        let mut definition =
            WorkflowDefinition::new("pipeline", "1.0.0", StrategyType::Sequential);
        let task_id = definition.add_task(task);
        let task_def = definition.task(task_id).unwrap().clone();
        let definition_id = definition.id;
        let name = definition.name.clone();
        fixture.definitions.register(definition).await.unwrap();

        let mut workflow =
            WorkflowExecution::new(definition_id, name, uuid::Uuid::new_v4().to_string(), HashMap::new());
        workflow.transition(WorkflowStatus::Running).unwrap();
        fixture.store.insert_workflow(workflow.clone()).await.unwrap();
        (workflow, task_def)
    }

    #[tokio::test]
    async fn test_local_execution_completes() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(0))).await;
        let (workflow, task_def) =
            running_workflow(&fixture, TaskDefinition::new("step", "flaky", 0)).await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        let status = fixture.service.execute(task.id).await.unwrap();

        assert_eq!(status, TaskStatus::Completed);
        let stored = fixture.store.task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.outputs[SUCCESS_KEY], "true");
    }

    #[tokio::test]
    async fn test_failure_enters_retry_then_exhausts() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(10))).await;
        let (workflow, task_def) = running_workflow(
            &fixture,
            TaskDefinition::new("step", "flaky", 0).with_retry_limit(2),
        )
        .await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();

        // Initial attempt plus two retries, then the budget is gone
        let status = fixture.service.execute(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::AwaitingRetry);

        for expected in [TaskStatus::AwaitingRetry, TaskStatus::Failed] {
            fixture.service.reset_for_retry(task.id).await.unwrap();
            let status = fixture.service.execute(task.id).await.unwrap();
            assert_eq!(status, expected);
        }

        let stored = fixture.store.task(task.id).await.unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("Task execution failed: step, reason: boom"));
    }

    #[tokio::test]
    async fn test_retry_count_never_exceeds_limit() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(10))).await;
        let (workflow, task_def) = running_workflow(
            &fixture,
            TaskDefinition::new("step", "flaky", 0).with_retry_limit(1),
        )
        .await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        fixture.service.execute(task.id).await.unwrap();
        fixture.service.reset_for_retry(task.id).await.unwrap();
        fixture.service.execute(task.id).await.unwrap();

        let stored = fixture.store.task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.retry_count <= 1);
    }

    #[tokio::test]
    async fn test_queued_execution_publishes_message() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(0))).await;
        let (workflow, task_def) = running_workflow(
            &fixture,
            TaskDefinition::new("remote", "transcode", 0).queued(),
        )
        .await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        let status = fixture.service.execute(task.id).await.unwrap();
        assert_eq!(status, TaskStatus::Running);

        let payload = fixture.dispatch.try_recv().await.unwrap();
        let message: TaskMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(message.task_execution_id, task.id);
        assert_eq!(message.task_type, "transcode");
    }

    #[tokio::test]
    async fn test_no_executor_for_local_task() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(0))).await;
        let (workflow, task_def) =
            running_workflow(&fixture, TaskDefinition::new("step", "unknown", 0)).await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        let err = fixture.service.execute(task.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NoExecutor(_)));

        // Task never started
        let stored = fixture.store.task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_workflow_discards_late_result() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(0))).await;
        let (workflow, task_def) = running_workflow(
            &fixture,
            TaskDefinition::new("remote", "transcode", 0).queued(),
        )
        .await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        fixture.service.execute(task.id).await.unwrap();

        fixture.store.cancel_workflow_cascade(workflow.id).await.unwrap();

        let status = fixture
            .service
            .complete(task.id, HashMap::new())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Cancelled);

        let stored = fixture.store.task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(stored.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_stale_completion_dropped() {
        let fixture = fixture(Arc::new(FlakyExecutor::new(0))).await;
        let (workflow, task_def) =
            running_workflow(&fixture, TaskDefinition::new("step", "flaky", 0)).await;

        let task = fixture
            .service
            .create(&workflow, &task_def, HashMap::new())
            .await
            .unwrap();
        fixture.service.execute(task.id).await.unwrap();

        // Replayed completion for an already-completed task is a no-op
        let status = fixture
            .service
            .complete(task.id, HashMap::new())
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);
    }
}
