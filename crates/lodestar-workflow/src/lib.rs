//! # Lodestar Workflow Engine
//!
//! A workflow orchestrator: declarative, versioned task graphs driven
//! through pluggable execution strategies with durable state, retries,
//! human-in-the-loop review and partial re-execution.
//!
//! ## Features
//!
//! - **Versioned Definitions**: Immutable workflow templates with ordered
//!   task definitions and per-task configuration
//! - **Execution Strategies**: Sequential, parallel and conditional
//!   drivers with success/failure branching
//! - **State Machines**: Enforced workflow and task lifecycles with
//!   timestamp invariants
//! - **Retry Policies**: Exponential backoff with jitter and a recurring
//!   retry scheduler
//! - **User Review**: Cooperative pause points resolved by approve,
//!   reject or restart decisions
//! - **Task Queue Contract**: Queued dispatch and asynchronous result
//!   ingress for out-of-process executors
//! - **Lifecycle Events**: Fire-and-forget notifications for every
//!   workflow, task and review transition
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lodestar_workflow::prelude::*;
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> WorkflowResult<()> {
//!     let orchestrator = Orchestrator::new();
//!     orchestrator.start();
//!
//!     let definition = WorkflowDefinition::new("health-check", "1.0.0", StrategyType::Sequential)
//!         .with_task(
//!             TaskDefinition::new("ping", "http", 0)
//!                 .with_config_entry("url", "https://${host}/health"),
//!         );
//!     orchestrator.register_definition(definition).await?;
//!
//!     let mut variables = HashMap::new();
//!     variables.insert("host".to_string(), "api.internal".to_string());
//!
//!     let workflow = orchestrator
//!         .start_workflow("health-check", Some("1.0.0"), None, variables)
//!         .await?;
//!     println!("workflow finished as {:?}", workflow.status);
//!
//!     orchestrator.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod queue;
pub mod retry;
pub mod review;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod store;
pub mod strategy;
pub mod task_service;

// Re-export commonly used types
pub use config::{EventLogLevel, EventsConfig, OrchestratorConfig, RetryConfig, SchedulerConfig};
pub use context::ExecutionContext;
pub use definition::{
    DefinitionRegistry, ExecutionMode, StrategyType, TaskDefinition, TaskDefinitionId,
    WorkflowDefinition, WorkflowDefinitionId,
};
pub use engine::WorkflowEngine;
pub use error::{WorkflowError, WorkflowResult};
pub use events::{
    EventPublisher, OrchestratorEvent, TaskEvent, TaskEventKind, UserReviewEvent,
    UserReviewEventKind, WorkflowEvent, WorkflowEventKind,
};
pub use executor::{http::HttpTaskExecutor, ExecutorRegistry, ExecutorSupport, TaskExecutor};
pub use queue::{MessageQueue, ResultIngress, TaskMessage, TaskResultMessage};
pub use retry::BackoffPolicy;
pub use review::UserReviewService;
pub use scheduler::RetryScheduler;
pub use service::WorkflowExecutionService;
pub use state::{
    ReviewDecision, ReviewPointId, TaskExecution, TaskExecutionId, TaskStatus, UserReviewPoint,
    WorkflowExecution, WorkflowExecutionId, WorkflowStatus,
};
pub use store::ExecutionStore;
pub use strategy::{
    ConditionalStrategy, ExecutionStrategy, ParallelStrategy, SequentialStrategy, StrategyCore,
    StrategyRegistry,
};
pub use task_service::TaskExecutionService;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::OrchestratorConfig;
    pub use crate::context::ExecutionContext;
    pub use crate::definition::{
        ExecutionMode, StrategyType, TaskDefinition, WorkflowDefinition,
    };
    pub use crate::error::{WorkflowError, WorkflowResult};
    pub use crate::events::{OrchestratorEvent, TaskEventKind, WorkflowEventKind};
    pub use crate::executor::{ExecutorSupport, TaskExecutor};
    pub use crate::state::{
        ReviewDecision, TaskExecution, TaskStatus, UserReviewPoint, WorkflowExecution,
        WorkflowStatus,
    };
    pub use crate::{Orchestrator, OrchestratorBuilder};
}

use crate::events::OrchestratorEvent as Event;
use lodestar_events::{EventBus, Subscription};
use std::collections::HashMap;
use std::sync::Arc;

/// Builder wiring the orchestrator's services together.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Creates a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let store = ExecutionStore::new();
        let definitions = Arc::new(DefinitionRegistry::new());
        let executors = Arc::new(ExecutorRegistry::new());
        executors.register(Arc::new(HttpTaskExecutor::new()));

        let bus: EventBus<Event> = EventBus::new();
        let publisher = EventPublisher::new(bus.clone(), config.events.clone());

        let dispatch_queue = MessageQueue::new(queue::TASK_DISPATCH_QUEUE);
        let result_queue = MessageQueue::new(queue::TASK_RESULT_QUEUE);

        let task_service = Arc::new(TaskExecutionService::new(
            store.clone(),
            Arc::clone(&definitions),
            Arc::clone(&executors),
            publisher.clone(),
            BackoffPolicy::from(&config.retry),
            dispatch_queue.clone(),
            config.task_execution.thread_pool_size,
        ));

        let service = Arc::new(WorkflowExecutionService::new(
            store.clone(),
            Arc::clone(&definitions),
            Arc::clone(&task_service),
            publisher.clone(),
        ));

        let review = Arc::new(UserReviewService::new(
            store.clone(),
            Arc::clone(&service),
            Arc::clone(&task_service),
            publisher.clone(),
        ));

        let core = StrategyCore::new(
            store.clone(),
            Arc::clone(&definitions),
            Arc::clone(&task_service),
            Arc::clone(&review),
        );
        let strategies = Arc::new(StrategyRegistry::with_builtin(core));

        let engine = Arc::new(WorkflowEngine::new(
            store.clone(),
            Arc::clone(&definitions),
            Arc::clone(&strategies),
            Arc::clone(&service),
            Arc::clone(&task_service),
        ));
        review.attach_engine(Arc::clone(&engine));

        let scheduler = Arc::new(RetryScheduler::new(
            store.clone(),
            Arc::clone(&task_service),
            Arc::clone(&engine),
            config.scheduler.clone(),
            config.retention.clone(),
        ));

        let ingress = Arc::new(ResultIngress::new(
            result_queue.clone(),
            store.clone(),
            Arc::clone(&task_service),
            Arc::clone(&engine),
        ));

        Orchestrator {
            config,
            store,
            definitions,
            executors,
            publisher,
            dispatch_queue,
            result_queue,
            task_service,
            service,
            review,
            engine,
            scheduler,
            ingress,
        }
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrator facade holding every service with a process-wide
/// lifecycle: build at startup, `start`, then `shutdown` before exit.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: ExecutionStore,
    definitions: Arc<DefinitionRegistry>,
    executors: Arc<ExecutorRegistry>,
    publisher: EventPublisher,
    dispatch_queue: MessageQueue,
    result_queue: MessageQueue,
    task_service: Arc<TaskExecutionService>,
    service: Arc<WorkflowExecutionService>,
    review: Arc<UserReviewService>,
    engine: Arc<WorkflowEngine>,
    scheduler: Arc<RetryScheduler>,
    ingress: Arc<ResultIngress>,
}

impl Orchestrator {
    /// Creates an orchestrator with default settings.
    pub fn new() -> Self {
        OrchestratorBuilder::new().build()
    }

    /// Returns a builder for customizing the orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Starts the retry scheduler and the result ingress.
    pub fn start(&self) {
        Arc::clone(&self.scheduler).start();
        Arc::clone(&self.ingress).start();
    }

    /// Stops background loops.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.ingress.stop();
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registers a task executor.
    pub fn register_executor(&self, executor: Arc<dyn TaskExecutor>) {
        self.executors.register(executor);
    }

    /// Registers a workflow definition.
    pub async fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<WorkflowDefinitionId> {
        self.definitions.register(definition).await
    }

    /// Starts a workflow execution and drives it until it finishes or
    /// suspends.
    pub async fn start_workflow(
        &self,
        name: &str,
        version: Option<&str>,
        correlation_id: Option<String>,
        variables: HashMap<String, String>,
    ) -> WorkflowResult<WorkflowExecution> {
        let workflow = self
            .service
            .start_workflow(name, version, correlation_id, variables)
            .await?;
        self.engine.execute_workflow(workflow.id).await?;
        self.store.workflow(workflow.id).await
    }

    /// Fetches an execution by id.
    pub async fn workflow(&self, id: WorkflowExecutionId) -> WorkflowResult<WorkflowExecution> {
        self.service.get(id).await
    }

    /// Fetches an execution by correlation id.
    pub async fn workflow_by_correlation(
        &self,
        correlation_id: &str,
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.get_by_correlation(correlation_id).await
    }

    /// Lists executions in a status.
    pub async fn workflows_by_status(&self, status: WorkflowStatus) -> Vec<WorkflowExecution> {
        self.service.list_by_status(status).await
    }

    /// Task executions of a workflow.
    pub async fn tasks_for_workflow(&self, id: WorkflowExecutionId) -> Vec<TaskExecution> {
        self.store.tasks_for_workflow(id).await
    }

    /// Pauses a running execution.
    pub async fn pause_workflow(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.pause(id).await
    }

    /// Resumes a paused execution and re-drives it.
    pub async fn resume_workflow(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.resume(id).await?;
        self.engine.execute_workflow(id).await?;
        self.store.workflow(id).await
    }

    /// Cancels an execution immediately.
    pub async fn cancel_workflow(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.cancel(id).await
    }

    /// Retries a failed execution.
    pub async fn retry_workflow(
        &self,
        id: WorkflowExecutionId,
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.retry(id).await?;
        self.engine.execute_workflow(id).await?;
        self.store.workflow(id).await
    }

    /// Re-runs a subset of a paused or failed execution's tasks.
    pub async fn retry_workflow_subset(
        &self,
        id: WorkflowExecutionId,
        task_ids: &[TaskDefinitionId],
    ) -> WorkflowResult<WorkflowExecution> {
        self.service.retry_subset(id).await?;
        self.engine.execute_task_subset(id, task_ids).await?;
        self.store.workflow(id).await
    }

    /// Deletes a terminal execution.
    pub async fn delete_workflow(&self, id: WorkflowExecutionId) -> WorkflowResult<()> {
        self.service.delete(id).await
    }

    /// Submits a review decision.
    pub async fn submit_review(
        &self,
        review_point_id: ReviewPointId,
        decision: ReviewDecision,
        reviewer: &str,
        comment: Option<String>,
    ) -> WorkflowResult<UserReviewPoint> {
        self.review
            .submit_review(review_point_id, decision, reviewer, comment)
            .await
    }

    /// Open review points across suspended workflows.
    pub async fn pending_reviews(&self) -> Vec<UserReviewPoint> {
        self.review.pending_reviews().await
    }

    /// Review points recorded for a workflow.
    pub async fn reviews_for_workflow(
        &self,
        id: WorkflowExecutionId,
    ) -> Vec<UserReviewPoint> {
        self.store.reviews_for_workflow(id).await
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription<Event> {
        self.publisher.subscribe(name)
    }

    /// The outbound task-dispatch queue (consumed by external workers).
    pub fn dispatch_queue(&self) -> &MessageQueue {
        &self.dispatch_queue
    }

    /// The inbound task-result queue (fed by external workers).
    pub fn result_queue(&self) -> &MessageQueue {
        &self.result_queue
    }

    /// The backing store.
    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    /// The task execution service.
    pub fn task_service(&self) -> &Arc<TaskExecutionService> {
        &self.task_service
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// The retry scheduler.
    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    /// The result ingress.
    pub fn ingress(&self) -> &Arc<ResultIngress> {
        &self.ingress
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}
