//! Lifecycle events and their fire-and-forget publisher.

use crate::config::{EventLogLevel, EventsConfig};
use crate::state::{
    ReviewPointId, TaskExecution, TaskExecutionId, TaskStatus, UserReviewPoint,
    WorkflowExecution, WorkflowExecutionId, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use lodestar_events::{EventBus, Subscription};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

/// Kind of a workflow lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventKind {
    Created,
    Started,
    Completed,
    Failed,
    Paused,
    Resumed,
    Cancelled,
    Retry,
    StatusChanged,
}

/// Kind of a task lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventKind {
    Created,
    Started,
    Completed,
    Failed,
    RetryScheduled,
    Skipped,
    Cancelled,
}

/// Kind of a user review event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserReviewEventKind {
    Requested,
    Submitted,
}

/// Workflow lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: WorkflowEventKind,
    pub timestamp: DateTime<Utc>,
    pub workflow_execution_id: WorkflowExecutionId,
    pub workflow_name: String,
    pub correlation_id: String,
    pub status: WorkflowStatus,
    pub attributes: HashMap<String, String>,
}

impl WorkflowEvent {
    /// Builds an event from the current state of an execution.
    pub fn new(kind: WorkflowEventKind, workflow: &WorkflowExecution) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            workflow_execution_id: workflow.id,
            workflow_name: workflow.workflow_name.clone(),
            correlation_id: workflow.correlation_id.clone(),
            status: workflow.status,
            attributes: HashMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Task lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub kind: TaskEventKind,
    pub timestamp: DateTime<Utc>,
    pub task_execution_id: TaskExecutionId,
    pub workflow_execution_id: WorkflowExecutionId,
    pub task_name: String,
    pub correlation_id: String,
    pub status: TaskStatus,
    pub attributes: HashMap<String, String>,
}

impl TaskEvent {
    /// Builds an event from the current state of a task execution.
    pub fn new(kind: TaskEventKind, task: &TaskExecution, correlation_id: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            task_execution_id: task.id,
            workflow_execution_id: task.workflow_execution_id,
            task_name: task.name.clone(),
            correlation_id: correlation_id.to_string(),
            status: task.status,
            attributes: HashMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// User review notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReviewEvent {
    pub kind: UserReviewEventKind,
    pub timestamp: DateTime<Utc>,
    pub review_point_id: ReviewPointId,
    pub task_execution_id: TaskExecutionId,
    pub workflow_execution_id: WorkflowExecutionId,
    pub correlation_id: String,
    pub reviewer: Option<String>,
    pub attributes: HashMap<String, String>,
}

impl UserReviewEvent {
    /// Builds an event from a review point.
    pub fn new(kind: UserReviewEventKind, point: &UserReviewPoint, correlation_id: &str) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            review_point_id: point.id,
            task_execution_id: point.task_execution_id,
            workflow_execution_id: point.workflow_execution_id,
            correlation_id: correlation_id.to_string(),
            reviewer: point.reviewer.clone(),
            attributes: HashMap::new(),
        }
    }
}

/// Union of all lifecycle notifications carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    Workflow(WorkflowEvent),
    Task(TaskEvent),
    UserReview(UserReviewEvent),
}

impl OrchestratorEvent {
    /// Event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestratorEvent::Workflow(e) => e.timestamp,
            OrchestratorEvent::Task(e) => e.timestamp,
            OrchestratorEvent::UserReview(e) => e.timestamp,
        }
    }

    /// Correlation id of the owning workflow execution.
    pub fn correlation_id(&self) -> &str {
        match self {
            OrchestratorEvent::Workflow(e) => &e.correlation_id,
            OrchestratorEvent::Task(e) => &e.correlation_id,
            OrchestratorEvent::UserReview(e) => &e.correlation_id,
        }
    }

    fn describe(&self) -> String {
        match self {
            OrchestratorEvent::Workflow(e) => format!(
                "workflow event {:?} for '{}' ({}) status {}",
                e.kind, e.workflow_name, e.correlation_id, e.status
            ),
            OrchestratorEvent::Task(e) => format!(
                "task event {:?} for '{}' ({}) status {}",
                e.kind, e.task_name, e.correlation_id, e.status
            ),
            OrchestratorEvent::UserReview(e) => format!(
                "review event {:?} for point {} ({})",
                e.kind, e.review_point_id, e.correlation_id
            ),
        }
    }
}

/// Fire-and-forget publisher for lifecycle events.
///
/// Publication never blocks on subscribers; when disabled, events are
/// dropped before reaching the bus.
#[derive(Clone)]
pub struct EventPublisher {
    bus: EventBus<OrchestratorEvent>,
    config: EventsConfig,
}

impl EventPublisher {
    /// Creates a publisher over a bus.
    pub fn new(bus: EventBus<OrchestratorEvent>, config: EventsConfig) -> Self {
        Self { bus, config }
    }

    /// Subscribes to the underlying bus.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<OrchestratorEvent> {
        self.bus.subscribe(name)
    }

    /// Publishes a workflow event.
    pub fn workflow(&self, kind: WorkflowEventKind, workflow: &WorkflowExecution) {
        self.publish(OrchestratorEvent::Workflow(WorkflowEvent::new(kind, workflow)));
    }

    /// Publishes a task event.
    pub fn task(&self, kind: TaskEventKind, task: &TaskExecution, correlation_id: &str) {
        self.publish(OrchestratorEvent::Task(TaskEvent::new(
            kind,
            task,
            correlation_id,
        )));
    }

    /// Publishes a user review event.
    pub fn review(
        &self,
        kind: UserReviewEventKind,
        point: &UserReviewPoint,
        correlation_id: &str,
    ) {
        self.publish(OrchestratorEvent::UserReview(UserReviewEvent::new(
            kind,
            point,
            correlation_id,
        )));
    }

    /// Publishes a prebuilt event.
    pub fn publish(&self, event: OrchestratorEvent) {
        if !self.config.enabled {
            return;
        }

        let line = event.describe();
        match self.config.log_level {
            EventLogLevel::Trace => trace!("{}", line),
            EventLogLevel::Debug => debug!("{}", line),
            EventLogLevel::Info => info!("{}", line),
            EventLogLevel::Warn => warn!("{}", line),
            EventLogLevel::Error => error!("{}", line),
        }

        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::TaskDefinition;
    use std::collections::HashMap as Map;
    use uuid::Uuid;

    fn publisher(enabled: bool) -> EventPublisher {
        let config = EventsConfig {
            enabled,
            ..Default::default()
        };
        EventPublisher::new(EventBus::new(), config)
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let publisher = publisher(true);
        let mut sub = publisher.subscribe("audit");

        let wf = WorkflowExecution::new(Uuid::new_v4(), "pipeline", "corr-1", Map::new());
        publisher.workflow(WorkflowEventKind::Created, &wf);

        match sub.next().await {
            Some(OrchestratorEvent::Workflow(event)) => {
                assert_eq!(event.kind, WorkflowEventKind::Created);
                assert_eq!(event.correlation_id, "corr-1");
                assert_eq!(event.workflow_name, "pipeline");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_publisher_drops_events() {
        let publisher = publisher(false);
        let mut sub = publisher.subscribe("audit");

        let wf = WorkflowExecution::new(Uuid::new_v4(), "pipeline", "corr-2", Map::new());
        publisher.workflow(WorkflowEventKind::Created, &wf);

        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_task_event_carries_names() {
        let publisher = publisher(true);
        let mut sub = publisher.subscribe("audit");

        let definition = TaskDefinition::new("extract", "http", 0);
        let task = TaskExecution::new(Uuid::new_v4(), &definition, Map::new());
        publisher.task(TaskEventKind::Created, &task, "corr-3");

        match sub.next().await {
            Some(OrchestratorEvent::Task(event)) => {
                assert_eq!(event.task_name, "extract");
                assert_eq!(event.correlation_id, "corr-3");
                assert_eq!(event.status, TaskStatus::Pending);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
