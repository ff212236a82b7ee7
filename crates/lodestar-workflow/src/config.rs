//! Orchestrator configuration.

use crate::error::{WorkflowError, WorkflowResult};
use serde::{Deserialize, Serialize};

/// Log level used when publishing lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Event publication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventsConfig {
    /// Whether lifecycle events are published at all.
    pub enabled: bool,

    /// Level each published event is logged at.
    pub log_level: EventLogLevel,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: EventLogLevel::Debug,
        }
    }
}

/// Local task execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskExecutionConfig {
    /// Size of the bounded pool driving local executors.
    pub thread_pool_size: usize,
}

impl Default for TaskExecutionConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 10,
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryConfig {
    /// Default retry budget for task definitions that do not set one.
    pub max_attempts: u32,

    /// First retry delay in milliseconds.
    pub initial_interval: u64,

    /// Backoff multiplier applied per attempt.
    pub multiplier: f64,

    /// Delay ceiling in milliseconds.
    pub max_interval: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: 1_000,
            multiplier: 2.0,
            max_interval: 60_000,
        }
    }
}

/// Retry scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SchedulerConfig {
    /// Seconds between retry ticks.
    pub tick_seconds: u64,

    /// Seconds between maintenance sweeps (stuck detection, retention).
    pub sweep_seconds: u64,

    /// Minutes after which a paused or review-blocked workflow is logged
    /// as stuck.
    pub stuck_after_minutes: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 30,
            sweep_seconds: 3_600,
            stuck_after_minutes: 60,
        }
    }
}

/// Retention settings for finished workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetentionConfig {
    /// Days a terminal workflow execution is kept before being purged.
    pub terminal_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { terminal_days: 30 }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct OrchestratorConfig {
    /// Event publication settings.
    pub events: EventsConfig,

    /// Local task execution settings.
    pub task_execution: TaskExecutionConfig,

    /// Retry backoff settings.
    pub retry: RetryConfig,

    /// Retry scheduler settings.
    pub scheduler: SchedulerConfig,

    /// Retention settings.
    pub retention: RetentionConfig,
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local worker pool size.
    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.task_execution.thread_pool_size = size;
        self
    }

    /// Sets the retry backoff settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the scheduler tick interval in seconds.
    pub fn with_tick_seconds(mut self, seconds: u64) -> Self {
        self.scheduler.tick_seconds = seconds;
        self
    }

    /// Disables event publication.
    pub fn without_events(mut self) -> Self {
        self.events.enabled = false;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.task_execution.thread_pool_size == 0 {
            return Err(WorkflowError::Configuration(
                "thread-pool-size must be at least 1".to_string(),
            ));
        }
        if self.scheduler.tick_seconds == 0 {
            return Err(WorkflowError::Configuration(
                "tick-seconds must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(WorkflowError::Configuration(
                "retry multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.retry.max_interval < self.retry.initial_interval {
            return Err(WorkflowError::Configuration(
                "retry max-interval must not be below initial-interval".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.events.enabled);
        assert_eq!(config.task_execution.thread_pool_size, 10);
        assert_eq!(config.retry.initial_interval, 1_000);
        assert_eq!(config.retry.max_interval, 60_000);
        assert_eq!(config.scheduler.tick_seconds, 30);
        assert_eq!(config.retention.terminal_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let config = OrchestratorConfig::new().with_thread_pool_size(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_intervals() {
        let config = OrchestratorConfig::new().with_retry(RetryConfig {
            initial_interval: 10_000,
            max_interval: 1_000,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let raw = r#"{
            "events": {"enabled": false, "log-level": "INFO"},
            "task-execution": {"thread-pool-size": 4},
            "retry": {"max-attempts": 5, "initial-interval": 500},
            "scheduler": {"tick-seconds": 10},
            "retention": {"terminal-days": 7}
        }"#;

        let config: OrchestratorConfig = serde_json::from_str(raw).unwrap();
        assert!(!config.events.enabled);
        assert_eq!(config.events.log_level, EventLogLevel::Info);
        assert_eq!(config.task_execution.thread_pool_size, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_interval, 500);
        assert_eq!(config.scheduler.tick_seconds, 10);
        assert_eq!(config.retention.terminal_days, 7);
    }
}
