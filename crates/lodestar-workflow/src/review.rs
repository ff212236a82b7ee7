//! User review service: cooperative pause points resolved by human
//! decisions.

use crate::engine::WorkflowEngine;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventPublisher, UserReviewEventKind};
use crate::service::WorkflowExecutionService;
use crate::state::{
    ReviewDecision, ReviewPointId, TaskExecutionId, UserReviewPoint, WorkflowStatus,
};
use crate::store::ExecutionStore;
use crate::task_service::TaskExecutionService;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Service owning review points and their decisions.
///
/// The engine is attached after construction because review decisions
/// re-enter it while strategies, which the engine owns, create review
/// points through this service.
pub struct UserReviewService {
    store: ExecutionStore,
    service: Arc<WorkflowExecutionService>,
    task_service: Arc<TaskExecutionService>,
    publisher: EventPublisher,
    engine: OnceLock<Arc<WorkflowEngine>>,
}

impl UserReviewService {
    /// Creates a review service; call [`attach_engine`](Self::attach_engine)
    /// before submitting decisions.
    pub fn new(
        store: ExecutionStore,
        service: Arc<WorkflowExecutionService>,
        task_service: Arc<TaskExecutionService>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            store,
            service,
            task_service,
            publisher,
            engine: OnceLock::new(),
        }
    }

    /// Attaches the engine used to resume workflows after a decision.
    pub fn attach_engine(&self, engine: Arc<WorkflowEngine>) {
        let _ = self.engine.set(engine);
    }

    fn engine(&self) -> WorkflowResult<&Arc<WorkflowEngine>> {
        self.engine
            .get()
            .ok_or_else(|| WorkflowError::Internal("review service has no engine".to_string()))
    }

    /// Creates an open review point for a task and suspends its workflow.
    pub async fn create_review_point(
        &self,
        task_id: TaskExecutionId,
    ) -> WorkflowResult<UserReviewPoint> {
        let task = self.store.task(task_id).await?;
        let workflow = self
            .service
            .update_status(task.workflow_execution_id, WorkflowStatus::AwaitingUserReview)
            .await?;

        let point = UserReviewPoint::new(workflow.id, task.id);
        self.store.insert_review(point.clone()).await?;

        info!(
            "Review requested for task '{}' ({}) of workflow {}",
            task.name, task.id, workflow.id
        );
        self.publisher.review(
            UserReviewEventKind::Requested,
            &point,
            &workflow.correlation_id,
        );
        Ok(point)
    }

    /// Records a decision and resumes the workflow accordingly.
    ///
    /// Approve completes the gated task (outputs may be empty), Reject
    /// fails it through the normal retry path, Restart resets the task and
    /// re-runs the workflow from its position.
    pub async fn submit_review(
        &self,
        review_point_id: ReviewPointId,
        decision: ReviewDecision,
        reviewer: &str,
        comment: Option<String>,
    ) -> WorkflowResult<UserReviewPoint> {
        let point = self.store.review(review_point_id).await?;
        if !point.is_open() {
            warn!(
                "Review point {} was already decided, recording a new decision",
                review_point_id
            );
        }

        let point = self
            .store
            .update_review(review_point_id, |p| {
                p.record(decision, reviewer, comment.clone());
                Ok(())
            })
            .await?;

        let task = self.store.task(point.task_execution_id).await?;
        let workflow = self.store.workflow(point.workflow_execution_id).await?;

        info!(
            "Review point {} decided {:?} by {} for task '{}'",
            point.id, decision, reviewer, task.name
        );
        self.publisher.review(
            UserReviewEventKind::Submitted,
            &point,
            &workflow.correlation_id,
        );

        let engine = self.engine()?;
        match decision {
            ReviewDecision::Approve => {
                self.task_service
                    .complete(task.id, HashMap::new())
                    .await?;
                self.service
                    .update_status(workflow.id, WorkflowStatus::Running)
                    .await?;
                engine.execute_workflow(workflow.id).await?;
            }
            ReviewDecision::Reject => {
                self.task_service
                    .fail(task.id, format!("Rejected by user: {}", reviewer))
                    .await?;
                self.service
                    .update_status(workflow.id, WorkflowStatus::Running)
                    .await?;
                engine.execute_workflow(workflow.id).await?;
            }
            ReviewDecision::Restart => {
                self.service
                    .update_status(workflow.id, WorkflowStatus::Running)
                    .await?;
                engine
                    .restart_task(workflow.id, task.task_definition_id)
                    .await?;
            }
        }

        self.store.review(review_point_id).await
    }

    /// Open review points across all workflows awaiting review.
    pub async fn pending_reviews(&self) -> Vec<UserReviewPoint> {
        let mut pending = Vec::new();
        for workflow in self
            .store
            .workflows_by_status(WorkflowStatus::AwaitingUserReview)
            .await
        {
            pending.extend(self.store.open_reviews_for_workflow(workflow.id).await);
        }
        pending.sort_by_key(|p| p.created_at);
        pending
    }
}
