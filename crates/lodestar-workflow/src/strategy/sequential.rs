//! Sequential execution strategy.

use crate::definition::{StrategyType, TaskDefinitionId};
use crate::error::{WorkflowError, WorkflowResult};
use crate::state::{TaskStatus, WorkflowExecutionId, WorkflowStatus};
use crate::strategy::{
    drive_subset, resolved_inputs, ExecutionStrategy, StrategyCore,
};
use async_trait::async_trait;
use tracing::{debug, info};

/// Drives tasks one at a time in execution order.
pub struct SequentialStrategy {
    core: StrategyCore,
}

impl SequentialStrategy {
    /// Creates a sequential strategy.
    pub fn new(core: StrategyCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ExecutionStrategy for SequentialStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Sequential
    }

    async fn execute(&self, workflow_id: WorkflowExecutionId) -> WorkflowResult<WorkflowStatus> {
        drive_ordered(&self.core, workflow_id, false).await
    }

    async fn execute_subset(
        &self,
        workflow_id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<WorkflowStatus> {
        drive_subset(&self.core, workflow_id, task_ids).await
    }
}

/// Ordered walk shared by the sequential and conditional strategies.
///
/// Resumption model: a re-driven walk reuses the latest execution record
/// for the task at the cursor instead of creating a duplicate, so retries,
/// queued results and review decisions all pick up where the previous
/// drive suspended.
pub(crate) async fn drive_ordered(
    core: &StrategyCore,
    workflow_id: WorkflowExecutionId,
    evaluate_conditions: bool,
) -> WorkflowResult<WorkflowStatus> {
    let workflow = core.store.workflow(workflow_id).await?;
    let definition = core.definitions.get(workflow.definition_id).await?;
    let tasks = definition.tasks();

    if tasks.is_empty() {
        info!("Workflow {} has no tasks, completing", workflow_id);
        return Ok(WorkflowStatus::Completed);
    }

    // Bounds error-path cycles formed by next_task_on_failure edges
    let mut failure_jumps = 0usize;

    loop {
        let workflow = core.store.workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            debug!(
                "Workflow {} is {}, suspending drive",
                workflow_id, workflow.status
            );
            return Ok(workflow.status);
        }

        let index = workflow.current_task_index;
        if index >= tasks.len() {
            return Ok(WorkflowStatus::Completed);
        }
        let task_def = &tasks[index];

        let existing = core.latest_execution(workflow_id, task_def.id).await;

        let task = match existing {
            Some(task) if task.status == TaskStatus::AwaitingRetry => {
                // The retry scheduler owns the next attempt
                return Ok(WorkflowStatus::Running);
            }
            Some(task) if task.status == TaskStatus::Running => {
                // Queued task still in flight
                debug!("Task '{}' ({}) still in flight", task.name, task.id);
                return Ok(WorkflowStatus::Running);
            }
            Some(task) if task.status == TaskStatus::Pending => {
                if task_def.require_user_review {
                    if core.store.open_reviews_for_task(task.id).await.is_empty() {
                        core.review.create_review_point(task.id).await?;
                    }
                    return Ok(WorkflowStatus::AwaitingUserReview);
                }
                let status = core.task_service.execute(task.id).await?;
                if matches!(status, TaskStatus::Running | TaskStatus::AwaitingRetry) {
                    return Ok(WorkflowStatus::Running);
                }
                core.store.task(task.id).await?
            }
            Some(task) => task,
            None => {
                if evaluate_conditions {
                    if let Some(expression) = &task_def.conditional_expression {
                        let context = crate::context::ExecutionContext::from_variables(
                            workflow.variables.clone(),
                        );
                        match crate::strategy::evaluate_condition(expression, &context) {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(
                                    "Condition '{}' false, skipping task '{}'",
                                    expression, task_def.name
                                );
                                let inputs = resolved_inputs(&workflow, task_def);
                                let task =
                                    core.task_service.create(&workflow, task_def, inputs).await?;
                                core.task_service.skip(task.id).await?;
                                core.set_index(workflow_id, index + 1).await?;
                                continue;
                            }
                            Err(e) => {
                                core.set_error(workflow_id, e.to_string()).await?;
                                return Ok(WorkflowStatus::Failed);
                            }
                        }
                    }
                }

                if task_def.require_user_review {
                    let inputs = resolved_inputs(&workflow, task_def);
                    let task = core.task_service.create(&workflow, task_def, inputs).await?;
                    core.review.create_review_point(task.id).await?;
                    return Ok(WorkflowStatus::AwaitingUserReview);
                }

                let inputs = resolved_inputs(&workflow, task_def);
                let task = core.task_service.create(&workflow, task_def, inputs).await?;
                let status = core.task_service.execute(task.id).await?;
                if matches!(status, TaskStatus::Running | TaskStatus::AwaitingRetry) {
                    return Ok(WorkflowStatus::Running);
                }
                core.store.task(task.id).await?
            }
        };

        match task.status {
            TaskStatus::Completed => {
                core.merge_outputs(workflow_id, &task).await?;
                let next = match task_def.next_task_on_success {
                    Some(target) => jump_target(core, &definition, workflow_id, target).await?,
                    None => index + 1,
                };
                core.set_index(workflow_id, next).await?;
            }
            TaskStatus::Skipped => {
                core.set_index(workflow_id, index + 1).await?;
            }
            TaskStatus::Failed => {
                let error = task
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("task '{}' failed", task.name));
                core.set_error(workflow_id, error).await?;

                match task_def.next_task_on_failure {
                    Some(target) => {
                        failure_jumps += 1;
                        if failure_jumps > tasks.len() {
                            core.set_error(
                                workflow_id,
                                "failure-path cycle detected, aborting workflow".to_string(),
                            )
                            .await?;
                            return Ok(WorkflowStatus::Failed);
                        }
                        info!(
                            "Task '{}' failed, continuing on failure path",
                            task_def.name
                        );
                        let next = jump_target(core, &definition, workflow_id, target).await?;
                        core.set_index(workflow_id, next).await?;
                    }
                    None => return Ok(WorkflowStatus::Failed),
                }
            }
            TaskStatus::Cancelled => {
                let workflow = core.store.workflow(workflow_id).await?;
                return Ok(workflow.status);
            }
            other => {
                debug!(
                    "Task '{}' in status {}, suspending drive",
                    task_def.name, other
                );
                return Ok(WorkflowStatus::Running);
            }
        }
    }
}

/// Resolves a branch target to its position, resurrecting a terminal
/// execution of the target so a backward jump re-runs it.
async fn jump_target(
    core: &StrategyCore,
    definition: &crate::definition::WorkflowDefinition,
    workflow_id: WorkflowExecutionId,
    target: TaskDefinitionId,
) -> WorkflowResult<usize> {
    let index = definition.task_index(target).ok_or_else(|| {
        WorkflowError::Validation(format!("branch target {} not in workflow definition", target))
    })?;

    if let Some(existing) = core.latest_execution(workflow_id, target).await {
        if existing.status.is_terminal() {
            core.task_service.reset_for_rerun(existing.id).await?;
        }
    }

    Ok(index)
}
