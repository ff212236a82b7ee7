//! Workflow and task lifecycle state machines and execution records.

use crate::definition::{
    ExecutionMode, TaskDefinition, TaskDefinitionId, WorkflowDefinitionId,
};
use crate::error::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// A unique identifier for a workflow execution.
pub type WorkflowExecutionId = Uuid;

/// A unique identifier for a task execution.
pub type TaskExecutionId = Uuid;

/// A unique identifier for a user review point.
pub type ReviewPointId = Uuid;

/// Lifecycle status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created but not yet started.
    Created,

    /// A strategy is (or may be) driving the execution.
    Running,

    /// Suspended by an operator.
    Paused,

    /// Suspended pending a human decision.
    AwaitingUserReview,

    /// Finished successfully.
    Completed,

    /// Finished with a failure.
    Failed,

    /// Cancelled by an operator.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Validates a status transition.
    ///
    /// `Failed -> Running` is the explicit retry edge; `Completed` and
    /// `Cancelled` are absorbing. Same-state transitions are allowed for
    /// non-terminal statuses only.
    pub fn can_transition_to(&self, new_status: &WorkflowStatus) -> bool {
        match (self, new_status) {
            (a, b) if a == b => !a.is_terminal(),

            (WorkflowStatus::Created, WorkflowStatus::Running) => true,
            (WorkflowStatus::Created, WorkflowStatus::Cancelled) => true,

            (WorkflowStatus::Running, WorkflowStatus::Completed) => true,
            (WorkflowStatus::Running, WorkflowStatus::Failed) => true,
            (WorkflowStatus::Running, WorkflowStatus::Cancelled) => true,
            (WorkflowStatus::Running, WorkflowStatus::Paused) => true,
            (WorkflowStatus::Running, WorkflowStatus::AwaitingUserReview) => true,

            (WorkflowStatus::Paused, WorkflowStatus::Running) => true,
            (WorkflowStatus::Paused, WorkflowStatus::Cancelled) => true,

            (WorkflowStatus::AwaitingUserReview, WorkflowStatus::Running) => true,
            (WorkflowStatus::AwaitingUserReview, WorkflowStatus::Cancelled) => true,
            (WorkflowStatus::AwaitingUserReview, WorkflowStatus::Failed) => true,

            (WorkflowStatus::Failed, WorkflowStatus::Running) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lifecycle status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, waiting to be dispatched.
    Pending,

    /// Executor invoked, or task message in flight.
    Running,

    /// Finished successfully.
    Completed,

    /// Failed terminally.
    Failed,

    /// Skipped by a conditional gate.
    Skipped,

    /// Cancelled along with its workflow.
    Cancelled,

    /// Failed with retry budget left; waiting for the next attempt.
    AwaitingRetry,
}

impl TaskStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// Validates a status transition.
    ///
    /// `Pending -> Completed` and `Pending -> Failed/AwaitingRetry` cover
    /// review decisions resolving a task that never ran.
    pub fn can_transition_to(&self, new_status: &TaskStatus) -> bool {
        match (self, new_status) {
            (a, b) if a == b => !a.is_terminal(),

            (TaskStatus::Pending, TaskStatus::Running) => true,
            (TaskStatus::Pending, TaskStatus::Skipped) => true,
            (TaskStatus::Pending, TaskStatus::Completed) => true,
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Pending, TaskStatus::AwaitingRetry) => true,
            (TaskStatus::Pending, TaskStatus::Cancelled) => true,

            (TaskStatus::Running, TaskStatus::Completed) => true,
            (TaskStatus::Running, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::AwaitingRetry) => true,
            (TaskStatus::Running, TaskStatus::Cancelled) => true,

            (TaskStatus::AwaitingRetry, TaskStatus::Running) => true,
            (TaskStatus::AwaitingRetry, TaskStatus::Pending) => true,
            (TaskStatus::AwaitingRetry, TaskStatus::Cancelled) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One run of a workflow definition.
///
/// Tasks, review points and variables reference the execution by id; the
/// execution does not hold child records itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique execution identifier.
    pub id: WorkflowExecutionId,

    /// Definition this execution runs.
    pub definition_id: WorkflowDefinitionId,

    /// Definition name, denormalized for events and logs.
    pub workflow_name: String,

    /// Externally unique correlation tag.
    pub correlation_id: String,

    /// Current lifecycle status.
    pub status: WorkflowStatus,

    /// First transition into `Running`.
    pub started_at: Option<DateTime<Utc>>,

    /// Transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Position of the next task for sequential-style strategies.
    pub current_task_index: usize,

    /// Workflow-level retry counter.
    pub retry_count: u32,

    /// Error recorded by the last failure.
    pub error_message: Option<String>,

    /// Shared mutable variables for the run.
    pub variables: HashMap<String, String>,
}

impl WorkflowExecution {
    /// Creates a new execution in `Created` status.
    pub fn new(
        definition_id: WorkflowDefinitionId,
        workflow_name: impl Into<String>,
        correlation_id: impl Into<String>,
        variables: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition_id,
            workflow_name: workflow_name.into(),
            correlation_id: correlation_id.into(),
            status: WorkflowStatus::Created,
            started_at: None,
            completed_at: None,
            current_task_index: 0,
            retry_count: 0,
            error_message: None,
            variables,
        }
    }

    /// Transitions to a new status, enforcing the state machine and the
    /// timestamp invariants.
    pub fn transition(&mut self, new_status: WorkflowStatus) -> WorkflowResult<()> {
        if !self.status.can_transition_to(&new_status) {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        if self.status != new_status {
            info!(
                "Workflow execution {} ({}) transitioning from {} to {}",
                self.id, self.correlation_id, self.status, new_status
            );
        }

        self.status = new_status;

        match self.status {
            WorkflowStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                // Leaving Failed via retry clears the completion stamp
                self.completed_at = None;
            }
            status if status.is_terminal() => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Execution duration in milliseconds, when finished.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// One run of one task definition inside a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Unique task execution identifier.
    pub id: TaskExecutionId,

    /// Owning workflow execution.
    pub workflow_execution_id: WorkflowExecutionId,

    /// Definition this execution runs.
    pub task_definition_id: TaskDefinitionId,

    /// Task name, denormalized for events and logs.
    pub name: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Last transition into `Running`.
    pub started_at: Option<DateTime<Utc>>,

    /// Transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Dispatch mode copied from the definition.
    pub execution_mode: ExecutionMode,

    /// Retries consumed so far; never exceeds the definition's limit.
    pub retry_count: u32,

    /// Earliest instant of the next retry while `AwaitingRetry`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Error recorded by the last failure.
    pub error_message: Option<String>,

    /// Resolved inputs captured at dispatch time.
    pub inputs: HashMap<String, String>,

    /// Outputs produced by the executor.
    pub outputs: HashMap<String, String>,
}

impl TaskExecution {
    /// Creates a new task execution in `Pending` status.
    pub fn new(
        workflow_execution_id: WorkflowExecutionId,
        definition: &TaskDefinition,
        inputs: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_execution_id,
            task_definition_id: definition.id,
            name: definition.name.clone(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            execution_mode: definition.execution_mode,
            retry_count: 0,
            next_retry_at: None,
            error_message: None,
            inputs,
            outputs: HashMap::new(),
        }
    }

    fn transition(&mut self, new_status: TaskStatus) -> WorkflowResult<()> {
        if !self.status.can_transition_to(&new_status) {
            return Err(WorkflowError::InvalidStateTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }
        self.status = new_status;
        Ok(())
    }

    /// Marks an attempt as started.
    pub fn start(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.next_retry_at = None;
        Ok(())
    }

    /// Marks the task as completed, merging outputs.
    pub fn complete(&mut self, outputs: HashMap<String, String>) -> WorkflowResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.outputs.extend(outputs);
        self.error_message = None;
        Ok(())
    }

    /// Schedules a retry after a failure with remaining budget.
    pub fn await_retry(
        &mut self,
        error: impl Into<String>,
        next_retry_at: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        self.transition(TaskStatus::AwaitingRetry)?;
        self.retry_count += 1;
        self.next_retry_at = Some(next_retry_at);
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Fails the task terminally.
    pub fn fail(&mut self, error: impl Into<String>) -> WorkflowResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Skips the task.
    pub fn skip(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Skipped)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Cancels the task along with its workflow.
    pub fn cancel(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Resets the task for a scheduler-driven retry attempt, keeping the
    /// retry counter.
    pub fn reset_for_retry(&mut self) -> WorkflowResult<()> {
        self.transition(TaskStatus::Pending)?;
        self.started_at = None;
        self.completed_at = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Resets the task to a fresh `Pending` record: timestamps, outputs,
    /// error and retry counter cleared. Used for explicit restarts and
    /// subset re-runs, which may resurrect terminal tasks.
    pub fn reset_full(&mut self, clear_retry_count: bool) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.next_retry_at = None;
        self.error_message = None;
        self.outputs.clear();
        if clear_retry_count {
            self.retry_count = 0;
        }
    }

    /// Execution duration in milliseconds, when finished.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds().max(0) as u64)
            }
            _ => None,
        }
    }
}

/// Human decision recorded against a review point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    /// Accept the task result and resume the workflow.
    Approve,

    /// Fail the task and resume the workflow on its failure path.
    Reject,

    /// Reset the task and re-run the workflow from its position.
    Restart,
}

/// A suspension marker tying a task execution to a pending human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReviewPoint {
    /// Unique review point identifier.
    pub id: ReviewPointId,

    /// Owning workflow execution.
    pub workflow_execution_id: WorkflowExecutionId,

    /// Task execution awaiting the decision.
    pub task_execution_id: TaskExecutionId,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Decision timestamp; `None` while the point is open.
    pub reviewed_at: Option<DateTime<Utc>>,

    /// Reviewer identity.
    pub reviewer: Option<String>,

    /// Reviewer comment.
    pub comment: Option<String>,

    /// Recorded decision.
    pub decision: Option<ReviewDecision>,
}

impl UserReviewPoint {
    /// Creates an open review point.
    pub fn new(
        workflow_execution_id: WorkflowExecutionId,
        task_execution_id: TaskExecutionId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_execution_id,
            task_execution_id,
            created_at: Utc::now(),
            reviewed_at: None,
            reviewer: None,
            comment: None,
            decision: None,
        }
    }

    /// Returns true while no decision has been recorded.
    pub fn is_open(&self) -> bool {
        self.reviewed_at.is_none()
    }

    /// Records a decision.
    pub fn record(
        &mut self,
        decision: ReviewDecision,
        reviewer: impl Into<String>,
        comment: Option<String>,
    ) {
        self.decision = Some(decision);
        self.reviewer = Some(reviewer.into());
        self.comment = comment;
        self.reviewed_at = Some(Utc::now());
    }
}
