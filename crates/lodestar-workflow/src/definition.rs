//! Workflow and task definitions with a versioned registry.

use crate::error::{WorkflowError, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// A unique identifier for a workflow definition.
pub type WorkflowDefinitionId = Uuid;

/// A unique identifier for a task definition.
pub type TaskDefinitionId = Uuid;

/// Execution strategy selector for a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyType {
    /// Tasks run one at a time in execution order.
    Sequential,

    /// Tasks are dispatched concurrently and awaited together.
    Parallel,

    /// Tasks run in order, gated by conditional expressions.
    Conditional,
}

/// How a task execution is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Run the executor in-process on the worker pool.
    Local,

    /// Publish a task message and wait for an asynchronous result.
    Queued,
}

/// Definition of a single task inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique task definition identifier.
    pub id: TaskDefinitionId,

    /// Human-readable task name.
    pub name: String,

    /// Executor selector.
    pub task_type: String,

    /// Position within the workflow; strictly ordered for sequential runs.
    pub execution_order: u32,

    /// Maximum number of retries after the initial attempt.
    pub retry_limit: u32,

    /// Bound on a single executor invocation.
    pub timeout_seconds: Option<u64>,

    /// Dispatch mode.
    pub execution_mode: ExecutionMode,

    /// Whether a human decision gates this task.
    pub require_user_review: bool,

    /// Boolean expression over context variables gating execution.
    pub conditional_expression: Option<String>,

    /// Branch target taken after this task completes.
    pub next_task_on_success: Option<TaskDefinitionId>,

    /// Branch target taken after this task fails terminally.
    pub next_task_on_failure: Option<TaskDefinitionId>,

    /// Task configuration; values may contain `${var}` placeholders.
    pub configuration: HashMap<String, String>,
}

impl TaskDefinition {
    /// Creates a new task definition.
    pub fn new(
        name: impl Into<String>,
        task_type: impl Into<String>,
        execution_order: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            execution_order,
            retry_limit: 3,
            timeout_seconds: None,
            execution_mode: ExecutionMode::Local,
            require_user_review: false,
            conditional_expression: None,
            next_task_on_success: None,
            next_task_on_failure: None,
            configuration: HashMap::new(),
        }
    }

    /// Sets the retry budget.
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the per-invocation timeout.
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Sets the dispatch mode.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Marks the task as queued for asynchronous execution.
    pub fn queued(mut self) -> Self {
        self.execution_mode = ExecutionMode::Queued;
        self
    }

    /// Requires a user review before this task runs.
    pub fn with_user_review(mut self) -> Self {
        self.require_user_review = true;
        self
    }

    /// Sets the conditional expression.
    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.conditional_expression = Some(expression.into());
        self
    }

    /// Sets the success branch target.
    pub fn on_success(mut self, task_id: TaskDefinitionId) -> Self {
        self.next_task_on_success = Some(task_id);
        self
    }

    /// Sets the failure branch target.
    pub fn on_failure(mut self, task_id: TaskDefinitionId) -> Self {
        self.next_task_on_failure = Some(task_id);
        self
    }

    /// Adds a configuration entry.
    pub fn with_config_entry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    /// Replaces the configuration map.
    pub fn with_configuration(mut self, configuration: HashMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }
}

/// A named, versioned workflow template: ordered task definitions plus a
/// strategy. Immutable once registered; updates register a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow definition identifier.
    pub id: WorkflowDefinitionId,

    /// Workflow name.
    pub name: String,

    /// Workflow description.
    pub description: Option<String>,

    /// Version label; `(name, version)` is unique in the registry.
    pub version: String,

    /// Strategy driving executions of this definition.
    pub strategy_type: StrategyType,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,

    tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    /// Creates a new workflow definition.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        strategy_type: StrategyType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            version: version.into(),
            strategy_type,
            created_at: now,
            updated_at: now,
            tasks: Vec::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a task, keeping the list sorted by execution order.
    pub fn add_task(&mut self, task: TaskDefinition) -> TaskDefinitionId {
        let task_id = task.id;
        self.tasks.push(task);
        self.tasks.sort_by_key(|t| t.execution_order);
        self.updated_at = Utc::now();
        task_id
    }

    /// Builder form of [`add_task`](Self::add_task).
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.add_task(task);
        self
    }

    /// Tasks in execution order.
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    /// Looks up a task definition by id.
    pub fn task(&self, task_id: TaskDefinitionId) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Position of a task definition in the ordered list.
    pub fn task_index(&self, task_id: TaskDefinitionId) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    /// Validates the definition.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.name.is_empty() {
            return Err(WorkflowError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }

        let mut orders = HashSet::new();
        let ids: HashSet<TaskDefinitionId> = self.tasks.iter().map(|t| t.id).collect();

        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "task {} has an empty name",
                    task.id
                )));
            }
            if task.task_type.is_empty() {
                return Err(WorkflowError::Validation(format!(
                    "task '{}' has an empty type",
                    task.name
                )));
            }
            if !orders.insert(task.execution_order) {
                return Err(WorkflowError::Validation(format!(
                    "duplicate execution order {} on task '{}'",
                    task.execution_order, task.name
                )));
            }
            for target in [task.next_task_on_success, task.next_task_on_failure]
                .into_iter()
                .flatten()
            {
                if !ids.contains(&target) {
                    return Err(WorkflowError::Validation(format!(
                        "task '{}' branches to unknown task {}",
                        task.name, target
                    )));
                }
            }
            if let Some(target) = task.next_task_on_success {
                let forward = self
                    .tasks
                    .iter()
                    .find(|t| t.id == target)
                    .map(|t| t.execution_order > task.execution_order)
                    .unwrap_or(false);
                if !forward {
                    return Err(WorkflowError::Validation(format!(
                        "task '{}' success branch must target a later task",
                        task.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Versioned registry of workflow definitions.
///
/// `(name, version)` is unique; definitions are immutable once registered.
pub struct DefinitionRegistry {
    definitions: Arc<RwLock<HashMap<WorkflowDefinitionId, Arc<WorkflowDefinition>>>>,
}

impl Default for DefinitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a definition, rejecting duplicate `(name, version)` pairs.
    pub async fn register(
        &self,
        definition: WorkflowDefinition,
    ) -> WorkflowResult<WorkflowDefinitionId> {
        definition.validate()?;

        let mut definitions = self.definitions.write().await;
        if definitions
            .values()
            .any(|d| d.name == definition.name && d.version == definition.version)
        {
            return Err(WorkflowError::DuplicateDefinition {
                name: definition.name,
                version: definition.version,
            });
        }

        let id = definition.id;
        info!(
            "Registered workflow definition '{}' version {}",
            definition.name, definition.version
        );
        definitions.insert(id, Arc::new(definition));
        Ok(id)
    }

    /// Gets a definition by id.
    pub async fn get(&self, id: WorkflowDefinitionId) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions
            .get(&id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow definition {}", id)))
    }

    /// Finds a definition by name and exact version.
    pub async fn find(
        &self,
        name: &str,
        version: &str,
    ) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions
            .values()
            .find(|d| d.name == name && d.version == version)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("Workflow definition {} version {}", name, version))
            })
    }

    /// Finds the most recently registered version of a definition.
    pub async fn latest(&self, name: &str) -> WorkflowResult<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions
            .values()
            .filter(|d| d.name == name)
            .max_by_key(|d| d.created_at)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow definition {}", name)))
    }

    /// Lists all registered definitions.
    pub async fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        definitions.values().cloned().collect()
    }

    /// Removes a definition by id.
    pub async fn remove(&self, id: WorkflowDefinitionId) -> WorkflowResult<()> {
        let mut definitions = self.definitions.write().await;
        definitions
            .remove(&id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Workflow definition {}", id)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("pipeline", "1.0.0", StrategyType::Sequential)
            .with_task(TaskDefinition::new("extract", "http", 0))
            .with_task(TaskDefinition::new("load", "http", 1))
    }

    #[test]
    fn test_tasks_sorted_by_execution_order() {
        let mut definition =
            WorkflowDefinition::new("pipeline", "1.0.0", StrategyType::Sequential);
        definition.add_task(TaskDefinition::new("second", "noop", 5));
        definition.add_task(TaskDefinition::new("first", "noop", 1));

        let names: Vec<&str> = definition.tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_validate_rejects_duplicate_order() {
        let definition = WorkflowDefinition::new("pipeline", "1.0.0", StrategyType::Sequential)
            .with_task(TaskDefinition::new("a", "noop", 0))
            .with_task(TaskDefinition::new("b", "noop", 0));

        assert!(definition.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_branch_target() {
        let definition = WorkflowDefinition::new("pipeline", "1.0.0", StrategyType::Sequential)
            .with_task(TaskDefinition::new("a", "noop", 0).on_failure(Uuid::new_v4()));

        assert!(definition.validate().is_err());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_identity() {
        let registry = DefinitionRegistry::new();
        registry.register(two_step_definition()).await.unwrap();

        let duplicate = two_step_definition();
        let err = registry.register(duplicate).await.unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateDefinition { .. }));
    }

    #[tokio::test]
    async fn test_registry_find_and_latest() {
        let registry = DefinitionRegistry::new();
        registry.register(two_step_definition()).await.unwrap();

        let mut v2 = WorkflowDefinition::new("pipeline", "2.0.0", StrategyType::Sequential);
        v2.add_task(TaskDefinition::new("only", "noop", 0));
        let v2_id = registry.register(v2).await.unwrap();

        let found = registry.find("pipeline", "1.0.0").await.unwrap();
        assert_eq!(found.version, "1.0.0");

        let latest = registry.latest("pipeline").await.unwrap();
        assert_eq!(latest.id, v2_id);

        assert!(registry.find("pipeline", "9.9.9").await.is_err());
    }
}
