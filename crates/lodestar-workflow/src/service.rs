//! Workflow execution service: owns the workflow state machine and the
//! execution queries.

use crate::definition::DefinitionRegistry;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventPublisher, WorkflowEventKind};
use crate::state::{
    TaskStatus, WorkflowExecution, WorkflowExecutionId, WorkflowStatus,
};
use crate::store::ExecutionStore;
use crate::task_service::TaskExecutionService;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Service owning workflow execution lifecycles.
pub struct WorkflowExecutionService {
    store: ExecutionStore,
    definitions: Arc<DefinitionRegistry>,
    task_service: Arc<TaskExecutionService>,
    publisher: EventPublisher,
}

impl WorkflowExecutionService {
    /// Creates a workflow service.
    pub fn new(
        store: ExecutionStore,
        definitions: Arc<DefinitionRegistry>,
        task_service: Arc<TaskExecutionService>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            definitions,
            task_service,
            publisher,
        }
    }

    /// Creates and persists a new execution of a definition.
    ///
    /// `version` of `None` selects the latest registered version;
    /// `correlation_id` of `None` generates one.
    pub async fn start_workflow(
        &self,
        name: &str,
        version: Option<&str>,
        correlation_id: Option<String>,
        variables: HashMap<String, String>,
    ) -> WorkflowResult<WorkflowExecution> {
        let definition = match version {
            Some(version) => self.definitions.find(name, version).await?,
            None => self.definitions.latest(name).await?,
        };

        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let workflow = WorkflowExecution::new(
            definition.id,
            definition.name.clone(),
            correlation_id,
            variables,
        );

        self.store.insert_workflow(workflow.clone()).await?;
        info!(
            "Created workflow execution {} of '{}' version {} ({})",
            workflow.id, definition.name, definition.version, workflow.correlation_id
        );
        self.publisher
            .workflow(WorkflowEventKind::Created, &workflow);
        Ok(workflow)
    }

    /// Fetches an execution by id.
    pub async fn get(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        self.store.workflow(id).await
    }

    /// Fetches an execution by correlation id.
    pub async fn get_by_correlation(
        &self,
        correlation_id: &str,
    ) -> WorkflowResult<WorkflowExecution> {
        self.store.workflow_by_correlation(correlation_id).await
    }

    /// Lists executions in a status.
    pub async fn list_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowExecution> {
        self.store.workflows_by_status(status).await
    }

    /// Transitions an execution, enforcing the state machine. Sets
    /// `completed_at` exactly when the new status is terminal and
    /// publishes a `StatusChanged` event.
    pub async fn update_status(
        &self,
        id: WorkflowExecutionId,
        status: WorkflowStatus,
    ) -> WorkflowResult<WorkflowExecution> {
        let workflow = self
            .store
            .update_workflow(id, |wf| wf.transition(status))
            .await?;

        self.publisher
            .workflow(WorkflowEventKind::StatusChanged, &workflow);
        match status {
            WorkflowStatus::Completed => {
                self.publisher
                    .workflow(WorkflowEventKind::Completed, &workflow);
            }
            WorkflowStatus::Failed => {
                self.publisher.workflow(WorkflowEventKind::Failed, &workflow);
            }
            _ => {}
        }
        Ok(workflow)
    }

    /// Marks an execution as started by the engine.
    pub async fn mark_started(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<WorkflowExecution> {
        let workflow = self
            .store
            .update_workflow(id, |wf| wf.transition(WorkflowStatus::Running))
            .await?;
        self.publisher.workflow(WorkflowEventKind::Started, &workflow);
        Ok(workflow)
    }

    /// Pauses a running execution.
    pub async fn pause(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let workflow = self.store.workflow(id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Err(WorkflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Paused.to_string(),
            });
        }

        let workflow = self.update_status(id, WorkflowStatus::Paused).await?;
        self.publisher.workflow(WorkflowEventKind::Paused, &workflow);
        Ok(workflow)
    }

    /// Resumes a paused execution; the caller re-drives the engine.
    pub async fn resume(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let workflow = self.store.workflow(id).await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(WorkflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }

        let workflow = self.update_status(id, WorkflowStatus::Running).await?;
        self.publisher.workflow(WorkflowEventKind::Resumed, &workflow);
        Ok(workflow)
    }

    /// Cancels an execution immediately, cascading to its open tasks.
    /// Results of in-flight work arriving later are discarded.
    pub async fn cancel(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let (workflow, cancelled) = self.store.cancel_workflow_cascade(id).await?;

        for task in &cancelled {
            self.publisher.task(
                crate::events::TaskEventKind::Cancelled,
                task,
                &workflow.correlation_id,
            );
        }
        self.publisher
            .workflow(WorkflowEventKind::Cancelled, &workflow);
        self.publisher
            .workflow(WorkflowEventKind::StatusChanged, &workflow);
        Ok(workflow)
    }

    /// Returns a failed execution to `Running` for another drive,
    /// incrementing the workflow retry counter. The task blocking the
    /// cursor is reset so the next drive re-runs it; its retry counter is
    /// preserved.
    pub async fn retry(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let workflow = self.store.workflow(id).await?;
        if workflow.status != WorkflowStatus::Failed {
            return Err(WorkflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }

        self.reset_blocking_task(&workflow).await?;

        let workflow = self
            .store
            .update_workflow(id, |wf| {
                wf.transition(WorkflowStatus::Running)?;
                wf.retry_count += 1;
                wf.error_message = None;
                Ok(())
            })
            .await?;
        self.publisher.workflow(WorkflowEventKind::Retry, &workflow);
        Ok(workflow)
    }

    /// Returns a paused or failed execution to `Running` ahead of a
    /// subset re-run.
    pub async fn retry_subset(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let workflow = self.store.workflow(id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Paused | WorkflowStatus::Failed
        ) {
            return Err(WorkflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: WorkflowStatus::Running.to_string(),
            });
        }

        let workflow = self.update_status(id, WorkflowStatus::Running).await?;
        self.publisher.workflow(WorkflowEventKind::Retry, &workflow);
        Ok(workflow)
    }

    /// Deletes a terminal execution, cascading to tasks, review points
    /// and variables.
    pub async fn delete(&self, id: WorkflowExecutionId) -> WorkflowResult<()> {
        self.store.delete_workflow(id).await
    }

    /// Terminal executions finished before `cutoff`.
    pub async fn find_completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Vec<WorkflowExecutionId> {
        self.store.completed_older_than(cutoff).await
    }

    /// Paused executions started before `cutoff`.
    pub async fn find_paused_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Vec<WorkflowExecution> {
        self.store.paused_older_than(cutoff).await
    }

    /// Resets the terminal task at the workflow cursor so a retry drive
    /// re-runs it instead of observing the old failure.
    async fn reset_blocking_task(&self, workflow: &WorkflowExecution) -> WorkflowResult<()> {
        let definition = self.definitions.get(workflow.definition_id).await?;
        let Some(task_def) = definition.tasks().get(workflow.current_task_index) else {
            return Ok(());
        };

        let blocking = self
            .store
            .tasks_for_workflow(workflow.id)
            .await
            .into_iter()
            .filter(|t| t.task_definition_id == task_def.id)
            .last();

        if let Some(task) = blocking {
            if task.status == TaskStatus::Failed {
                self.task_service.reset_for_rerun(task.id).await?;
            }
        }
        Ok(())
    }
}
