//! In-memory execution store with relational-table semantics.
//!
//! Workflow executions own their tasks, review points and variables by id
//! (arena-style); children are fetched on demand. Every public method
//! acquires the lock once, which is the linearisation point standing in
//! for a database transaction.

use crate::error::{WorkflowError, WorkflowResult};
use crate::state::{
    ReviewPointId, TaskExecution, TaskExecutionId, TaskStatus, UserReviewPoint,
    WorkflowExecution, WorkflowExecutionId, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Default)]
struct StoreInner {
    workflows: HashMap<WorkflowExecutionId, WorkflowExecution>,
    correlation_index: HashMap<String, WorkflowExecutionId>,
    tasks: HashMap<TaskExecutionId, TaskExecution>,
    workflow_tasks: HashMap<WorkflowExecutionId, Vec<TaskExecutionId>>,
    review_points: HashMap<ReviewPointId, UserReviewPoint>,
    workflow_reviews: HashMap<WorkflowExecutionId, Vec<ReviewPointId>>,
}

/// Durable state for workflow executions, task executions and review
/// points.
#[derive(Clone)]
pub struct ExecutionStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        }
    }

    // ---- workflow executions ----

    /// Persists a new workflow execution, enforcing correlation-id
    /// uniqueness.
    pub async fn insert_workflow(&self, workflow: WorkflowExecution) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if inner.correlation_index.contains_key(&workflow.correlation_id) {
            return Err(WorkflowError::DuplicateCorrelationId(
                workflow.correlation_id.clone(),
            ));
        }

        inner
            .correlation_index
            .insert(workflow.correlation_id.clone(), workflow.id);
        inner.workflow_tasks.entry(workflow.id).or_default();
        inner.workflow_reviews.entry(workflow.id).or_default();
        debug!("Persisted workflow execution {}", workflow.id);
        inner.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    /// Fetches a workflow execution by id.
    pub async fn workflow(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        let inner = self.inner.read().await;
        inner
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow execution {}", id)))
    }

    /// Fetches a workflow execution by correlation id.
    pub async fn workflow_by_correlation(
        &self,
        correlation_id: &str,
    ) -> WorkflowResult<WorkflowExecution> {
        let inner = self.inner.read().await;
        let id = inner.correlation_index.get(correlation_id).ok_or_else(|| {
            WorkflowError::NotFound(format!("Workflow execution with correlation {}", correlation_id))
        })?;
        inner
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow execution {}", id)))
    }

    /// Lists workflow executions in a given status.
    pub async fn workflows_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowExecution> {
        let inner = self.inner.read().await;
        inner
            .workflows
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect()
    }

    /// Applies a mutation to a workflow execution and returns the updated
    /// record.
    pub async fn update_workflow<F>(
        &self,
        id: WorkflowExecutionId,
        mutate: F,
    ) -> WorkflowResult<WorkflowExecution>
    where
        F: FnOnce(&mut WorkflowExecution) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow execution {}", id)))?;
        mutate(workflow)?;
        Ok(workflow.clone())
    }

    /// Cancels a workflow and every non-terminal task it owns in one
    /// transaction. Returns the cancelled tasks.
    pub async fn cancel_workflow_cascade(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<(WorkflowExecution, Vec<TaskExecution>)> {
        let mut inner = self.inner.write().await;
        let workflow = inner
            .workflows
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow execution {}", id)))?;
        workflow.transition(WorkflowStatus::Cancelled)?;
        let workflow = workflow.clone();

        let task_ids = inner.workflow_tasks.get(&id).cloned().unwrap_or_default();
        let mut cancelled = Vec::new();
        for task_id in task_ids {
            if let Some(task) = inner.tasks.get_mut(&task_id) {
                if !task.status.is_terminal() {
                    task.cancel()?;
                    cancelled.push(task.clone());
                }
            }
        }

        info!(
            "Cancelled workflow execution {} and {} open tasks",
            id,
            cancelled.len()
        );
        Ok((workflow, cancelled))
    }

    /// Deletes a terminal workflow execution, cascading to its tasks,
    /// review points and variables.
    pub async fn delete_workflow(&self, id: WorkflowExecutionId) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        let workflow = inner
            .workflows
            .get(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow execution {}", id)))?;

        if !workflow.status.is_terminal() {
            return Err(WorkflowError::InvalidStateTransition {
                from: workflow.status.to_string(),
                to: "deleted".to_string(),
            });
        }

        let correlation_id = workflow.correlation_id.clone();
        inner.workflows.remove(&id);
        inner.correlation_index.remove(&correlation_id);

        if let Some(task_ids) = inner.workflow_tasks.remove(&id) {
            for task_id in task_ids {
                inner.tasks.remove(&task_id);
            }
        }
        if let Some(review_ids) = inner.workflow_reviews.remove(&id) {
            for review_id in review_ids {
                inner.review_points.remove(&review_id);
            }
        }

        info!("Deleted workflow execution {}", id);
        Ok(())
    }

    /// Terminal workflow executions that finished before `cutoff`.
    pub async fn completed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Vec<WorkflowExecutionId> {
        let inner = self.inner.read().await;
        inner
            .workflows
            .values()
            .filter(|w| w.status.is_terminal())
            .filter(|w| w.completed_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|w| w.id)
            .collect()
    }

    /// Paused workflow executions started before `cutoff`.
    pub async fn paused_older_than(&self, cutoff: DateTime<Utc>) -> Vec<WorkflowExecution> {
        let inner = self.inner.read().await;
        inner
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::Paused)
            .filter(|w| w.started_at.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Review-blocked workflow executions started before `cutoff`.
    pub async fn awaiting_review_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Vec<WorkflowExecution> {
        let inner = self.inner.read().await;
        inner
            .workflows
            .values()
            .filter(|w| w.status == WorkflowStatus::AwaitingUserReview)
            .filter(|w| w.started_at.map(|t| t < cutoff).unwrap_or(false))
            .cloned()
            .collect()
    }

    // ---- task executions ----

    /// Persists a new task execution under its workflow.
    pub async fn insert_task(&self, task: TaskExecution) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.workflows.contains_key(&task.workflow_execution_id) {
            return Err(WorkflowError::NotFound(format!(
                "Workflow execution {}",
                task.workflow_execution_id
            )));
        }
        inner
            .workflow_tasks
            .entry(task.workflow_execution_id)
            .or_default()
            .push(task.id);
        debug!("Persisted task execution {} ({})", task.id, task.name);
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    /// Fetches a task execution by id.
    pub async fn task(&self, id: TaskExecutionId) -> WorkflowResult<TaskExecution> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Task execution {}", id)))
    }

    /// Applies a mutation to a task execution and returns the updated
    /// record.
    pub async fn update_task<F>(
        &self,
        id: TaskExecutionId,
        mutate: F,
    ) -> WorkflowResult<TaskExecution>
    where
        F: FnOnce(&mut TaskExecution) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Task execution {}", id)))?;
        mutate(task)?;
        Ok(task.clone())
    }

    /// Task executions belonging to a workflow, in creation order.
    pub async fn tasks_for_workflow(
        &self,
        workflow_id: WorkflowExecutionId,
    ) -> Vec<TaskExecution> {
        let inner = self.inner.read().await;
        inner
            .workflow_tasks
            .get(&workflow_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.tasks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tasks awaiting retry whose `next_retry_at` has passed.
    pub async fn tasks_to_retry(&self, now: DateTime<Utc>) -> Vec<TaskExecution> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::AwaitingRetry)
            .filter(|t| t.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .cloned()
            .collect()
    }

    // ---- review points ----

    /// Persists a new review point under its workflow.
    pub async fn insert_review(&self, review: UserReviewPoint) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.workflows.contains_key(&review.workflow_execution_id) {
            return Err(WorkflowError::NotFound(format!(
                "Workflow execution {}",
                review.workflow_execution_id
            )));
        }
        inner
            .workflow_reviews
            .entry(review.workflow_execution_id)
            .or_default()
            .push(review.id);
        inner.review_points.insert(review.id, review);
        Ok(())
    }

    /// Fetches a review point by id.
    pub async fn review(&self, id: ReviewPointId) -> WorkflowResult<UserReviewPoint> {
        let inner = self.inner.read().await;
        inner
            .review_points
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Review point {}", id)))
    }

    /// Applies a mutation to a review point and returns the updated
    /// record.
    pub async fn update_review<F>(
        &self,
        id: ReviewPointId,
        mutate: F,
    ) -> WorkflowResult<UserReviewPoint>
    where
        F: FnOnce(&mut UserReviewPoint) -> WorkflowResult<()>,
    {
        let mut inner = self.inner.write().await;
        let review = inner
            .review_points
            .get_mut(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Review point {}", id)))?;
        mutate(review)?;
        Ok(review.clone())
    }

    /// Review points belonging to a workflow, in creation order.
    pub async fn reviews_for_workflow(
        &self,
        workflow_id: WorkflowExecutionId,
    ) -> Vec<UserReviewPoint> {
        let inner = self.inner.read().await;
        inner
            .workflow_reviews
            .get(&workflow_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.review_points.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Open review points for one workflow.
    pub async fn open_reviews_for_workflow(
        &self,
        workflow_id: WorkflowExecutionId,
    ) -> Vec<UserReviewPoint> {
        self.reviews_for_workflow(workflow_id)
            .await
            .into_iter()
            .filter(|r| r.is_open())
            .collect()
    }

    /// Open review points for a task execution.
    pub async fn open_reviews_for_task(
        &self,
        task_id: TaskExecutionId,
    ) -> Vec<UserReviewPoint> {
        let inner = self.inner.read().await;
        inner
            .review_points
            .values()
            .filter(|r| r.task_execution_id == task_id && r.is_open())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinition;
    use std::collections::HashMap as Map;
    use uuid::Uuid;

    fn workflow(correlation: &str) -> WorkflowExecution {
        WorkflowExecution::new(Uuid::new_v4(), "pipeline", correlation, Map::new())
    }

    #[tokio::test]
    async fn test_correlation_id_unique() {
        let store = ExecutionStore::new();
        store.insert_workflow(workflow("corr-1")).await.unwrap();

        let err = store.insert_workflow(workflow("corr-1")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateCorrelationId(_)));
    }

    #[tokio::test]
    async fn test_lookup_by_correlation() {
        let store = ExecutionStore::new();
        let wf = workflow("corr-2");
        let id = wf.id;
        store.insert_workflow(wf).await.unwrap();

        let found = store.workflow_by_correlation("corr-2").await.unwrap();
        assert_eq!(found.id, id);
        assert!(store.workflow_by_correlation("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_requires_terminal_and_cascades() {
        let store = ExecutionStore::new();
        let mut wf = workflow("corr-3");
        wf.transition(WorkflowStatus::Running).unwrap();
        let wf_id = wf.id;
        store.insert_workflow(wf).await.unwrap();

        let definition = TaskDefinition::new("extract", "http", 0);
        let task = TaskExecution::new(wf_id, &definition, Map::new());
        let task_id = task.id;
        store.insert_task(task).await.unwrap();
        store
            .insert_review(UserReviewPoint::new(wf_id, task_id))
            .await
            .unwrap();

        // Running workflows cannot be deleted
        assert!(store.delete_workflow(wf_id).await.is_err());

        store
            .update_workflow(wf_id, |w| w.transition(WorkflowStatus::Cancelled))
            .await
            .unwrap();
        store.delete_workflow(wf_id).await.unwrap();

        assert!(store.workflow(wf_id).await.is_err());
        assert!(store.task(task_id).await.is_err());
        assert!(store.reviews_for_workflow(wf_id).await.is_empty());
        // Correlation id is released
        assert!(store.workflow_by_correlation("corr-3").await.is_err());
    }

    #[tokio::test]
    async fn test_tasks_to_retry_filters_on_due_time() {
        let store = ExecutionStore::new();
        let mut wf = workflow("corr-4");
        wf.transition(WorkflowStatus::Running).unwrap();
        let wf_id = wf.id;
        store.insert_workflow(wf).await.unwrap();

        let definition = TaskDefinition::new("flaky", "http", 0);
        let mut due = TaskExecution::new(wf_id, &definition, Map::new());
        due.start().unwrap();
        due.await_retry("boom", Utc::now() - chrono::Duration::seconds(5))
            .unwrap();
        let due_id = due.id;
        store.insert_task(due).await.unwrap();

        let mut later = TaskExecution::new(wf_id, &definition, Map::new());
        later.start().unwrap();
        later
            .await_retry("boom", Utc::now() + chrono::Duration::minutes(5))
            .unwrap();
        store.insert_task(later).await.unwrap();

        let ready = store.tasks_to_retry(Utc::now()).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, due_id);
    }

    #[tokio::test]
    async fn test_cancel_cascade_cancels_open_tasks() {
        let store = ExecutionStore::new();
        let mut wf = workflow("corr-5");
        wf.transition(WorkflowStatus::Running).unwrap();
        let wf_id = wf.id;
        store.insert_workflow(wf).await.unwrap();

        let definition = TaskDefinition::new("step", "http", 0);
        let mut done = TaskExecution::new(wf_id, &definition, Map::new());
        done.start().unwrap();
        done.complete(Map::new()).unwrap();
        store.insert_task(done).await.unwrap();

        let open = TaskExecution::new(wf_id, &definition, Map::new());
        let open_id = open.id;
        store.insert_task(open).await.unwrap();

        let (wf, cancelled) = store.cancel_workflow_cascade(wf_id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, open_id);
    }

    #[tokio::test]
    async fn test_open_reviews() {
        let store = ExecutionStore::new();
        let mut wf = workflow("corr-6");
        wf.transition(WorkflowStatus::Running).unwrap();
        let wf_id = wf.id;
        store.insert_workflow(wf).await.unwrap();

        let definition = TaskDefinition::new("gate", "manual", 0);
        let task = TaskExecution::new(wf_id, &definition, Map::new());
        let task_id = task.id;
        store.insert_task(task).await.unwrap();

        let point = UserReviewPoint::new(wf_id, task_id);
        let point_id = point.id;
        store.insert_review(point).await.unwrap();

        assert_eq!(store.open_reviews_for_workflow(wf_id).await.len(), 1);
        assert_eq!(store.open_reviews_for_task(task_id).await.len(), 1);

        store
            .update_review(point_id, |r| {
                r.record(crate::state::ReviewDecision::Approve, "admin", None);
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.open_reviews_for_workflow(wf_id).await.is_empty());
    }
}
