//! Task executor contract and registry.

pub mod http;

use crate::context::ExecutionContext;
use crate::definition::TaskDefinition;
use crate::error::{WorkflowError, WorkflowResult};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Conventional output key reporting executor success.
pub const SUCCESS_KEY: &str = "success";

/// Output key stamped on every post-processed result.
pub const EXECUTION_TIMESTAMP_KEY: &str = "executionTimestamp";

/// Capability implemented by every task executor.
///
/// Executors return a map whose conventional keys include [`SUCCESS_KEY`]
/// plus executor-specific fields. Any returned error is treated as a
/// retriable task failure unless [`WorkflowError::is_fatal`] holds.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Task type this executor handles.
    fn task_type(&self) -> &str;

    /// Executes one task attempt.
    async fn execute(
        &self,
        definition: &TaskDefinition,
        context: &ExecutionContext,
    ) -> WorkflowResult<HashMap<String, Value>>;
}

/// String-keyed executor registry; registration is explicit at startup.
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn TaskExecutor>>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            executors: DashMap::new(),
        }
    }

    /// Registers an executor under its task type.
    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type().to_string();
        info!("Registered executor for task type: {}", task_type);
        self.executors.insert(task_type, executor);
    }

    /// Looks up the executor for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).map(|entry| Arc::clone(&entry))
    }

    /// Returns true if a task type has an executor.
    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    /// Registered task types.
    pub fn task_types(&self) -> Vec<String> {
        self.executors.iter().map(|e| e.key().clone()).collect()
    }
}

/// Shared pre/post-processing embedded by executors (composition in place
/// of an abstract base class).
///
/// `prepare` substitutes `${var}` placeholders in the task configuration
/// and then checks the required keys; `finalize` stamps
/// [`EXECUTION_TIMESTAMP_KEY`] on the result.
#[derive(Debug, Clone, Default)]
pub struct ExecutorSupport {
    required_keys: Vec<String>,
}

impl ExecutorSupport {
    /// Creates support with no required keys.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a configuration key as required.
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    /// Substitutes and validates a task's configuration.
    pub fn prepare(
        &self,
        definition: &TaskDefinition,
        context: &ExecutionContext,
    ) -> WorkflowResult<HashMap<String, String>> {
        let resolved = context.substitute_map(&definition.configuration);

        for key in &self.required_keys {
            let missing = resolved.get(key).map(|v| v.is_empty()).unwrap_or(true);
            if missing {
                return Err(WorkflowError::Validation(format!(
                    "task '{}' is missing required configuration key '{}'",
                    definition.name, key
                )));
            }
        }

        Ok(resolved)
    }

    /// Post-processes an executor result.
    pub fn finalize(&self, mut outputs: HashMap<String, Value>) -> HashMap<String, Value> {
        outputs
            .entry(EXECUTION_TIMESTAMP_KEY.to_string())
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        outputs
    }
}
