//! Workflow engine: the single entry point that drives executions.

use crate::definition::{DefinitionRegistry, TaskDefinitionId};
use crate::error::{WorkflowError, WorkflowResult};
use crate::service::WorkflowExecutionService;
use crate::state::{WorkflowExecutionId, WorkflowStatus};
use crate::store::ExecutionStore;
use crate::strategy::StrategyRegistry;
use crate::task_service::TaskExecutionService;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Top-level coordinator: resolves the strategy for a workflow, drives it
/// and applies the status the strategy reports.
pub struct WorkflowEngine {
    store: ExecutionStore,
    definitions: Arc<DefinitionRegistry>,
    strategies: Arc<StrategyRegistry>,
    service: Arc<WorkflowExecutionService>,
    task_service: Arc<TaskExecutionService>,
}

impl WorkflowEngine {
    /// Creates an engine.
    pub fn new(
        store: ExecutionStore,
        definitions: Arc<DefinitionRegistry>,
        strategies: Arc<StrategyRegistry>,
        service: Arc<WorkflowExecutionService>,
        task_service: Arc<TaskExecutionService>,
    ) -> Self {
        Self {
            store,
            definitions,
            strategies,
            service,
            task_service,
        }
    }

    /// Drives a workflow execution.
    ///
    /// No-op unless the execution is `Created` or `Running`; a `Created`
    /// execution is started first. Uncaught drive errors mark the
    /// workflow `Failed`.
    pub async fn execute_workflow(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<()> {
        let workflow = self.store.workflow(workflow_id).await?;

        match workflow.status {
            WorkflowStatus::Created => {
                self.service.mark_started(workflow_id).await?;
            }
            WorkflowStatus::Running => {}
            other => {
                debug!(
                    "Workflow {} is {}, nothing to drive",
                    workflow_id, other
                );
                return Ok(());
            }
        }

        let definition = self.definitions.get(workflow.definition_id).await?;
        let strategy = match self.strategies.resolve(definition.strategy_type) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.mark_failed(workflow_id, &e).await;
                return Err(e);
            }
        };

        info!(
            "Driving workflow {} with {:?} strategy",
            workflow_id, definition.strategy_type
        );

        match strategy.execute(workflow_id).await {
            Ok(status) => self.apply_reported_status(workflow_id, status).await,
            Err(e) => {
                self.mark_failed(workflow_id, &e).await;
                Err(e)
            }
        }
    }

    /// Resets a task and re-drives the workflow from its position.
    pub async fn restart_task(
        &self,
        workflow_id: WorkflowExecutionId,
        task_definition_id: TaskDefinitionId,
    ) -> WorkflowResult<()> {
        let workflow = self.store.workflow(workflow_id).await?;
        let definition = self.definitions.get(workflow.definition_id).await?;
        let index = definition.task_index(task_definition_id).ok_or_else(|| {
            WorkflowError::NotFound(format!(
                "Task definition {} in workflow definition {}",
                task_definition_id, definition.id
            ))
        })?;

        let existing = self
            .store
            .tasks_for_workflow(workflow_id)
            .await
            .into_iter()
            .filter(|t| t.task_definition_id == task_definition_id)
            .last();
        if let Some(task) = existing {
            self.task_service.restart(task.id).await?;
        }

        self.store
            .update_workflow(workflow_id, |wf| {
                wf.current_task_index = index;
                Ok(())
            })
            .await?;

        info!(
            "Restarting workflow {} from task index {}",
            workflow_id, index
        );
        self.execute_workflow(workflow_id).await
    }

    /// Drives only the named task definitions.
    pub async fn execute_task_subset(
        &self,
        workflow_id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<()> {
        let workflow = self.store.workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            self.service
                .update_status(workflow_id, WorkflowStatus::Running)
                .await?;
        }

        let definition = self.definitions.get(workflow.definition_id).await?;
        let strategy = match self.strategies.resolve(definition.strategy_type) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.mark_failed(workflow_id, &e).await;
                return Err(e);
            }
        };

        match strategy.execute_subset(workflow_id, task_ids).await {
            Ok(status) => self.apply_reported_status(workflow_id, status).await,
            Err(e) => {
                self.mark_failed(workflow_id, &e).await;
                Err(e)
            }
        }
    }

    /// Applies the status a strategy reported: terminal statuses are
    /// committed, suspensions leave the persisted status untouched.
    async fn apply_reported_status(
        &self,
        workflow_id: WorkflowExecutionId,
        reported: WorkflowStatus,
    ) -> WorkflowResult<()> {
        let workflow = self.store.workflow(workflow_id).await?;
        if workflow.status == reported {
            return Ok(());
        }

        match reported {
            WorkflowStatus::Completed | WorkflowStatus::Failed => {
                self.service.update_status(workflow_id, reported).await?;
            }
            other => {
                debug!(
                    "Workflow {} reported {} while persisted as {}, leaving as-is",
                    workflow_id, other, workflow.status
                );
            }
        }
        Ok(())
    }

    /// Marks a workflow failed after an uncaught drive error.
    async fn mark_failed(&self, workflow_id: WorkflowExecutionId, cause: &WorkflowError) {
        error!("Workflow {} drive failed: {}", workflow_id, cause);

        let message = cause.to_string();
        let recorded = self
            .store
            .update_workflow(workflow_id, |wf| {
                wf.error_message = Some(message);
                Ok(())
            })
            .await;
        if let Err(e) = recorded {
            error!("Unable to record failure on workflow {}: {}", workflow_id, e);
            return;
        }

        if let Err(e) = self
            .service
            .update_status(workflow_id, WorkflowStatus::Failed)
            .await
        {
            error!("Unable to fail workflow {}: {}", workflow_id, e);
        }
    }
}
