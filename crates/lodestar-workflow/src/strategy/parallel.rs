//! Parallel execution strategy.

use crate::definition::{StrategyType, TaskDefinitionId};
use crate::error::WorkflowResult;
use crate::state::{TaskStatus, WorkflowExecutionId, WorkflowStatus};
use crate::strategy::{drive_subset, resolved_inputs, ExecutionStrategy, StrategyCore};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

/// Creates all task executions up front and dispatches them concurrently.
///
/// Branching (`next_task_on_*`) is ignored; the workflow reaches a
/// terminal status only once every task has. The aggregate rule: `Failed`
/// when any task failed with its retries exhausted, else suspended while
/// reviews or retries are outstanding, else `Completed` when every task
/// landed in `Completed` or `Skipped`.
pub struct ParallelStrategy {
    core: StrategyCore,
}

impl ParallelStrategy {
    /// Creates a parallel strategy.
    pub fn new(core: StrategyCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ExecutionStrategy for ParallelStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Parallel
    }

    async fn execute(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<WorkflowStatus> {
        let core = &self.core;
        let workflow = core.store.workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Ok(workflow.status);
        }

        let definition = core.definitions.get(workflow.definition_id).await?;
        let tasks = definition.tasks();
        if tasks.is_empty() {
            return Ok(WorkflowStatus::Completed);
        }

        // Ensure one execution record per definition while the workflow is
        // still Running; review gates transition the status afterwards.
        let mut runnable = Vec::new();
        let mut review_pending = Vec::new();

        for task_def in tasks {
            match core.latest_execution(workflow_id, task_def.id).await {
                None => {
                    let inputs = resolved_inputs(&workflow, task_def);
                    let task = core.task_service.create(&workflow, task_def, inputs).await?;
                    if task_def.require_user_review {
                        review_pending.push(task.id);
                    } else {
                        runnable.push(task.id);
                    }
                }
                Some(task) if task.status == TaskStatus::Pending => {
                    if task_def.require_user_review {
                        if core.store.open_reviews_for_task(task.id).await.is_empty() {
                            review_pending.push(task.id);
                        }
                    } else {
                        runnable.push(task.id);
                    }
                }
                // In-flight, awaiting retry or already terminal
                Some(task) => {
                    debug!("Task '{}' already in status {}", task.name, task.status);
                }
            }
        }

        for task_id in review_pending {
            core.review.create_review_point(task_id).await?;
        }

        // Dispatch the wave; the task service's worker pool bounds the
        // actual concurrency.
        let attempts = join_all(runnable.into_iter().map(|task_id| {
            let service = Arc::clone(&core.task_service);
            async move { (task_id, service.execute(task_id).await) }
        }))
        .await;

        for (task_id, result) in attempts {
            if let Err(e) = result {
                warn!("Parallel dispatch of task {} failed: {}", task_id, e);
                core.set_error(workflow_id, e.to_string()).await?;
                return Ok(WorkflowStatus::Failed);
            }
        }

        self.aggregate(workflow_id).await
    }

    async fn execute_subset(
        &self,
        workflow_id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<WorkflowStatus> {
        drive_subset(&self.core, workflow_id, task_ids).await
    }
}

impl ParallelStrategy {
    /// Folds the per-task statuses into the workflow status.
    async fn aggregate(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<WorkflowStatus> {
        let core = &self.core;
        let workflow = core.store.workflow(workflow_id).await?;
        let definition = core.definitions.get(workflow.definition_id).await?;

        let mut failure: Option<String> = None;
        let mut open_review = false;
        let mut outstanding = false;
        let mut completed = Vec::new();

        for task_def in definition.tasks() {
            let task = match core.latest_execution(workflow_id, task_def.id).await {
                Some(task) => task,
                None => {
                    outstanding = true;
                    continue;
                }
            };

            match task.status {
                TaskStatus::Completed => completed.push(task),
                TaskStatus::Skipped | TaskStatus::Cancelled => {}
                TaskStatus::Failed => {
                    if failure.is_none() {
                        failure = Some(task.error_message.clone().unwrap_or_else(|| {
                            format!("task '{}' failed", task.name)
                        }));
                    }
                }
                TaskStatus::AwaitingRetry | TaskStatus::Running => outstanding = true,
                TaskStatus::Pending => {
                    if core.store.open_reviews_for_task(task.id).await.is_empty() {
                        outstanding = true;
                    } else {
                        open_review = true;
                    }
                }
            }
        }

        if let Some(error) = failure {
            core.set_error(workflow_id, error).await?;
            return Ok(WorkflowStatus::Failed);
        }
        if open_review {
            return Ok(WorkflowStatus::AwaitingUserReview);
        }
        if outstanding {
            return Ok(WorkflowStatus::Running);
        }

        // Merge outputs in execution order once the whole wave settled
        for task in completed {
            core.merge_outputs(workflow_id, &task).await?;
        }
        Ok(WorkflowStatus::Completed)
    }
}
