//! Execution strategies: policies deciding order, parallelism and
//! branching of task executions.

pub mod conditional;
pub mod parallel;
pub mod sequential;

pub use conditional::{evaluate_condition, ConditionalStrategy};
pub use parallel::ParallelStrategy;
pub use sequential::SequentialStrategy;

use crate::context::ExecutionContext;
use crate::definition::{DefinitionRegistry, StrategyType, TaskDefinition, TaskDefinitionId};
use crate::error::{WorkflowError, WorkflowResult};
use crate::review::UserReviewService;
use crate::state::{TaskExecution, TaskStatus, WorkflowExecution, WorkflowExecutionId, WorkflowStatus};
use crate::store::ExecutionStore;
use crate::task_service::TaskExecutionService;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Contract implemented by every execution strategy.
///
/// A strategy drives tasks from the workflow's `current_task_index` onward
/// and reports the workflow status it arrived at: a terminal status, or a
/// suspension (`Running` while retries or queued results are outstanding,
/// `AwaitingUserReview` at a review gate). The engine applies the reported
/// status.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Strategy type this implementation handles.
    fn strategy_type(&self) -> StrategyType;

    /// Drives a workflow execution forward.
    async fn execute(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<WorkflowStatus>;

    /// Drives only the given task definitions, preserving their execution
    /// order and ignoring review gates.
    async fn execute_subset(
        &self,
        workflow_id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<WorkflowStatus>;
}

/// Shared collaborators handed to every strategy.
#[derive(Clone)]
pub struct StrategyCore {
    pub(crate) store: ExecutionStore,
    pub(crate) definitions: Arc<DefinitionRegistry>,
    pub(crate) task_service: Arc<TaskExecutionService>,
    pub(crate) review: Arc<UserReviewService>,
}

impl StrategyCore {
    /// Bundles the collaborators strategies need.
    pub fn new(
        store: ExecutionStore,
        definitions: Arc<DefinitionRegistry>,
        task_service: Arc<TaskExecutionService>,
        review: Arc<UserReviewService>,
    ) -> Self {
        Self {
            store,
            definitions,
            task_service,
            review,
        }
    }

    /// Latest task execution for a definition within a workflow.
    pub(crate) async fn latest_execution(
        &self,
        workflow_id: WorkflowExecutionId,
        task_definition_id: TaskDefinitionId,
    ) -> Option<TaskExecution> {
        self.store
            .tasks_for_workflow(workflow_id)
            .await
            .into_iter()
            .filter(|t| t.task_definition_id == task_definition_id)
            .last()
    }

    /// Records an error message on the workflow.
    pub(crate) async fn set_error(
        &self,
        workflow_id: WorkflowExecutionId,
        error: String,
    ) -> WorkflowResult<()> {
        self.store
            .update_workflow(workflow_id, |wf| {
                wf.error_message = Some(error);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Moves the workflow's task cursor.
    pub(crate) async fn set_index(
        &self,
        workflow_id: WorkflowExecutionId,
        index: usize,
    ) -> WorkflowResult<()> {
        self.store
            .update_workflow(workflow_id, |wf| {
                wf.current_task_index = index;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Merges task outputs into the workflow variables.
    pub(crate) async fn merge_outputs(
        &self,
        workflow_id: WorkflowExecutionId,
        task: &TaskExecution,
    ) -> WorkflowResult<()> {
        self.store
            .update_workflow(workflow_id, |wf| {
                for (key, value) in &task.outputs {
                    wf.variables.insert(key.clone(), value.clone());
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Inputs for a task: its variable-substituted configuration unioned with
/// the workflow variables, configuration winning on collisions.
pub(crate) fn resolved_inputs(
    workflow: &WorkflowExecution,
    definition: &TaskDefinition,
) -> HashMap<String, String> {
    let context = ExecutionContext::from_variables(workflow.variables.clone());
    let mut inputs = context.substitute_map(&definition.configuration);
    for (key, value) in &workflow.variables {
        inputs.entry(key.clone()).or_insert_with(|| value.clone());
    }
    inputs
}

/// Drives the tasks named by `task_ids` in execution order, ignoring
/// review gates and conditions. Shared by every strategy's
/// [`ExecutionStrategy::execute_subset`].
pub(crate) async fn drive_subset(
    core: &StrategyCore,
    workflow_id: WorkflowExecutionId,
    task_ids: &[TaskDefinitionId],
) -> WorkflowResult<WorkflowStatus> {
    if task_ids.is_empty() {
        return Ok(WorkflowStatus::Completed);
    }

    let workflow = core.store.workflow(workflow_id).await?;
    let definition = core.definitions.get(workflow.definition_id).await?;

    let mut selected: Vec<&TaskDefinition> = definition
        .tasks()
        .iter()
        .filter(|t| task_ids.contains(&t.id))
        .collect();
    selected.sort_by_key(|t| t.execution_order);

    if selected.is_empty() {
        return Err(WorkflowError::NotFound(
            "none of the requested tasks belong to the workflow definition".to_string(),
        ));
    }

    for task_def in selected {
        let workflow = core.store.workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Ok(workflow.status);
        }

        // Reuse the previous execution record when one exists so the
        // retry counter carries over; otherwise create a fresh one.
        let task = match core.latest_execution(workflow_id, task_def.id).await {
            Some(existing) => {
                core.task_service.reset_for_rerun(existing.id).await?
            }
            None => {
                let inputs = resolved_inputs(&workflow, task_def);
                core.task_service.create(&workflow, task_def, inputs).await?
            }
        };

        let status = core.task_service.execute(task.id).await?;
        match status {
            TaskStatus::Completed => {
                let task = core.store.task(task.id).await?;
                core.merge_outputs(workflow_id, &task).await?;
            }
            TaskStatus::Failed => {
                let task = core.store.task(task.id).await?;
                let error = task
                    .error_message
                    .unwrap_or_else(|| format!("task '{}' failed", task.name));
                core.set_error(workflow_id, error).await?;
                return Ok(WorkflowStatus::Failed);
            }
            TaskStatus::Running | TaskStatus::AwaitingRetry => {
                return Ok(WorkflowStatus::Running);
            }
            other => {
                warn!(
                    "Subset task '{}' finished in unexpected status {}",
                    task_def.name, other
                );
            }
        }
    }

    Ok(WorkflowStatus::Completed)
}

/// Strategy registry with sequential fallback.
pub struct StrategyRegistry {
    strategies: HashMap<StrategyType, Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Creates a registry with all built-in strategies.
    pub fn with_builtin(core: StrategyCore) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SequentialStrategy::new(core.clone())));
        registry.register(Arc::new(ParallelStrategy::new(core.clone())));
        registry.register(Arc::new(ConditionalStrategy::new(core)));
        registry
    }

    /// Registers a strategy under its type.
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.insert(strategy.strategy_type(), strategy);
    }

    /// Looks up a strategy without fallback.
    pub fn get(&self, strategy_type: StrategyType) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies.get(&strategy_type).cloned()
    }

    /// Resolves a strategy, falling back to sequential when the mapped one
    /// is absent. Fails when even sequential is missing.
    pub fn resolve(&self, strategy_type: StrategyType) -> WorkflowResult<Arc<dyn ExecutionStrategy>> {
        if let Some(strategy) = self.get(strategy_type) {
            return Ok(strategy);
        }

        warn!(
            "No strategy registered for {:?}, falling back to sequential",
            strategy_type
        );
        self.get(StrategyType::Sequential).ok_or_else(|| {
            WorkflowError::Configuration(
                "no execution strategy available, not even sequential".to_string(),
            )
        })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
