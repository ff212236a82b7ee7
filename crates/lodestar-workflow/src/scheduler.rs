//! Retry scheduler: recurring tick that re-drives due retries, flags
//! stuck workflows and purges old terminal executions.

use crate::config::{RetentionConfig, SchedulerConfig};
use crate::engine::WorkflowEngine;
use crate::state::{TaskExecution, TaskStatus};
use crate::store::ExecutionStore;
use crate::task_service::TaskExecutionService;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Consecutive tick failures before forcing workflow-level recovery.
const DRIVE_FAILURE_LIMIT: u32 = 3;

/// Recurring scheduler for retries and maintenance.
pub struct RetryScheduler {
    store: ExecutionStore,
    task_service: Arc<TaskExecutionService>,
    engine: Arc<WorkflowEngine>,
    config: SchedulerConfig,
    retention: RetentionConfig,
    drive_failures: Mutex<HashMap<uuid::Uuid, u32>>,
    retry_handle: Mutex<Option<JoinHandle<()>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        store: ExecutionStore,
        task_service: Arc<TaskExecutionService>,
        engine: Arc<WorkflowEngine>,
        config: SchedulerConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            store,
            task_service,
            engine,
            config,
            retention,
            drive_failures: Mutex::new(HashMap::new()),
            retry_handle: Mutex::new(None),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Starts the retry and maintenance loops.
    pub fn start(self: Arc<Self>) {
        {
            let mut handle = self.retry_handle.lock();
            if handle.is_some() {
                warn!("Retry scheduler already running");
                return;
            }

            let scheduler = Arc::clone(&self);
            let tick = self.config.tick_seconds;
            *handle = Some(tokio::spawn(async move {
                info!("Retry scheduler started, tick every {}s", tick);
                let mut interval =
                    tokio::time::interval(tokio::time::Duration::from_secs(tick.max(1)));
                // The first tick of a tokio interval fires immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    scheduler.run_retry_tick().await;
                }
            }));
        }

        let scheduler = Arc::clone(&self);
        let sweep = self.config.sweep_seconds;
        *self.sweep_handle.lock() = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(sweep.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                scheduler.run_sweep().await;
            }
        }));
    }

    /// Stops both loops.
    pub fn stop(&self) {
        if let Some(handle) = self.retry_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
        info!("Retry scheduler stopped");
    }

    /// One retry tick: re-runs every due task and re-drives its workflow.
    /// Public so a host can tick manually in tests or embedded setups.
    pub async fn run_retry_tick(&self) {
        let due = self.task_service.tasks_to_retry(Utc::now()).await;
        if due.is_empty() {
            return;
        }
        debug!("Retry tick found {} due task(s)", due.len());

        for task in due {
            match self.drive(&task).await {
                Ok(()) => {
                    self.drive_failures.lock().remove(&task.id);
                }
                Err(e) => {
                    warn!("Retry drive for task {} failed: {}", task.id, e);
                    let failures = {
                        let mut map = self.drive_failures.lock();
                        let entry = map.entry(task.id).or_insert(0);
                        *entry += 1;
                        *entry
                    };

                    // A task that left the retry set will not be seen on
                    // the next tick, so recover its workflow right away
                    let still_due = self
                        .store
                        .task(task.id)
                        .await
                        .map(|t| t.status == TaskStatus::AwaitingRetry)
                        .unwrap_or(false);

                    if failures >= DRIVE_FAILURE_LIMIT || !still_due {
                        self.drive_failures.lock().remove(&task.id);
                        warn!(
                            "Task {} failed {} consecutive ticks, forcing workflow recovery",
                            task.id, failures
                        );
                        if let Err(e) = self
                            .engine
                            .execute_workflow(task.workflow_execution_id)
                            .await
                        {
                            error!(
                                "Workflow-level recovery for {} failed: {}",
                                task.workflow_execution_id, e
                            );
                        }
                    }
                }
            }
        }
    }

    async fn drive(&self, task: &TaskExecution) -> crate::error::WorkflowResult<()> {
        self.task_service.reset_for_retry(task.id).await?;
        self.task_service.execute(task.id).await?;
        self.engine.execute_workflow(task.workflow_execution_id).await?;
        Ok(())
    }

    /// One maintenance sweep: logs stuck workflows and purges terminal
    /// executions past retention.
    pub async fn run_sweep(&self) {
        let stuck_cutoff = Utc::now() - Duration::minutes(self.config.stuck_after_minutes);

        for workflow in self.store.paused_older_than(stuck_cutoff).await {
            warn!(
                "Workflow {} ({}) paused since {:?}",
                workflow.id, workflow.correlation_id, workflow.started_at
            );
        }
        for workflow in self.store.awaiting_review_older_than(stuck_cutoff).await {
            warn!(
                "Workflow {} ({}) awaiting user review since {:?}",
                workflow.id, workflow.correlation_id, workflow.started_at
            );
        }

        let retention_cutoff = Utc::now() - Duration::days(self.retention.terminal_days);
        let expired = self.store.completed_older_than(retention_cutoff).await;
        for workflow_id in expired {
            match self.store.delete_workflow(workflow_id).await {
                Ok(()) => info!("Purged terminal workflow {}", workflow_id),
                Err(e) => warn!("Unable to purge workflow {}: {}", workflow_id, e),
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.retry_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
    }
}
