//! Task queue wire contract and the asynchronous result ingress.
//!
//! Queue names are external contracts: queued tasks are published to
//! [`TASK_DISPATCH_QUEUE`] and their results arrive on
//! [`TASK_RESULT_QUEUE`]. The in-process [`MessageQueue`] stands in for
//! the broker; payloads cross it as JSON strings, exactly as they would a
//! real wire.

use crate::engine::WorkflowEngine;
use crate::error::{WorkflowError, WorkflowResult};
use crate::state::{TaskExecutionId, WorkflowStatus};
use crate::store::ExecutionStore;
use crate::task_service::TaskExecutionService;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Name of the outbound task-dispatch queue.
pub const TASK_DISPATCH_QUEUE: &str = "task-dispatch";

/// Name of the inbound task-result queue.
pub const TASK_RESULT_QUEUE: &str = "task-result";

/// Outbound dispatch message for a queued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_execution_id: TaskExecutionId,
    pub task_type: String,
    pub inputs: HashMap<String, String>,
    pub configuration: HashMap<String, String>,
}

/// Inbound result message for a queued task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultMessage {
    pub task_execution_id: TaskExecutionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TaskResultMessage {
    /// Builds a success result.
    pub fn success(task_execution_id: TaskExecutionId, outputs: HashMap<String, Value>) -> Self {
        Self {
            task_execution_id,
            outputs: Some(outputs),
            error_message: None,
        }
    }

    /// Builds a failure result.
    pub fn failure(task_execution_id: TaskExecutionId, error: impl Into<String>) -> Self {
        Self {
            task_execution_id,
            outputs: None,
            error_message: Some(error.into()),
        }
    }

    /// Returns true when the message reports success.
    pub fn is_success(&self) -> bool {
        self.error_message.is_none()
    }
}

/// In-process stand-in for one broker queue carrying JSON payloads.
#[derive(Clone)]
pub struct MessageQueue {
    name: &'static str,
    sender: mpsc::UnboundedSender<String>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl MessageQueue {
    /// Creates a named queue.
    pub fn new(name: &'static str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Publishes a payload.
    pub fn publish(&self, payload: String) -> WorkflowResult<()> {
        debug!("Publishing to queue {}", self.name);
        self.sender
            .send(payload)
            .map_err(|_| WorkflowError::Queue(format!("queue {} is closed", self.name)))
    }

    /// Receives the next payload, waiting until one arrives or the queue
    /// closes.
    pub async fn recv(&self) -> Option<String> {
        self.receiver.lock().await.recv().await
    }

    /// Receives a payload without waiting.
    pub async fn try_recv(&self) -> Option<String> {
        self.receiver.lock().await.try_recv().ok()
    }
}

/// Consumer of the task-result queue.
///
/// Success messages complete the corresponding task, failure messages fail
/// it, unknown ids are logged and dropped, and the engine is re-driven
/// when the owning workflow is still running.
pub struct ResultIngress {
    results: MessageQueue,
    store: ExecutionStore,
    task_service: Arc<TaskExecutionService>,
    engine: Arc<WorkflowEngine>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResultIngress {
    /// Creates an ingress over the result queue.
    pub fn new(
        results: MessageQueue,
        store: ExecutionStore,
        task_service: Arc<TaskExecutionService>,
        engine: Arc<WorkflowEngine>,
    ) -> Self {
        Self {
            results,
            store,
            task_service,
            engine,
            handle: Mutex::new(None),
        }
    }

    /// Starts the consumer loop.
    pub fn start(self: Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("Result ingress already running");
            return;
        }

        let ingress = Arc::clone(&self);
        *handle = Some(tokio::spawn(async move {
            info!("Result ingress consuming queue {}", TASK_RESULT_QUEUE);
            while let Some(payload) = ingress.results.recv().await {
                if let Err(e) = ingress.ingest(&payload).await {
                    warn!("Dropping task result message: {}", e);
                }
            }
            info!("Result ingress drained");
        }));
    }

    /// Stops the consumer loop.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Result ingress stopped");
        }
    }

    /// Processes one raw payload from the result queue.
    pub async fn ingest(&self, payload: &str) -> WorkflowResult<()> {
        let message: TaskResultMessage = serde_json::from_str(payload)
            .map_err(|e| WorkflowError::Transport(e.to_string()))?;
        self.process(message).await
    }

    /// Processes one decoded result message.
    pub async fn process(&self, message: TaskResultMessage) -> WorkflowResult<()> {
        let task = match self.store.task(message.task_execution_id).await {
            Ok(task) => task,
            Err(WorkflowError::NotFound(_)) => {
                warn!(
                    "Result for unknown task execution {}, dropping",
                    message.task_execution_id
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match message.error_message {
            Some(error) => {
                self.task_service.fail(task.id, error).await?;
            }
            None => {
                let outputs = message.outputs.unwrap_or_default();
                self.task_service.complete(task.id, outputs).await?;
            }
        }

        let workflow = self.store.workflow(task.workflow_execution_id).await?;
        if workflow.status == WorkflowStatus::Running {
            self.engine.execute_workflow(workflow.id).await?;
        }

        Ok(())
    }
}

impl Drop for ResultIngress {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_publish_recv() {
        let queue = MessageQueue::new(TASK_DISPATCH_QUEUE);
        queue.publish("one".to_string()).unwrap();
        queue.publish("two".to_string()).unwrap();

        assert_eq!(queue.recv().await.as_deref(), Some("one"));
        assert_eq!(queue.try_recv().await.as_deref(), Some("two"));
        assert!(queue.try_recv().await.is_none());
    }

    #[test]
    fn test_result_message_roundtrip() {
        let id = uuid::Uuid::new_v4();
        let message = TaskResultMessage::failure(id, "boom");
        let json = serde_json::to_string(&message).unwrap();

        let decoded: TaskResultMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.task_execution_id, id);
        assert!(!decoded.is_success());
        assert_eq!(decoded.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_malformed_result_is_transport_error() {
        let err = serde_json::from_str::<TaskResultMessage>("{not json")
            .map_err(|e| WorkflowError::Transport(e.to_string()))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Transport(_)));
    }

    #[test]
    fn test_task_message_wire_shape() {
        let id = uuid::Uuid::new_v4();
        let mut inputs = HashMap::new();
        inputs.insert("url".to_string(), "https://example.test".to_string());
        let message = TaskMessage {
            task_execution_id: id,
            task_type: "http".to_string(),
            inputs,
            configuration: HashMap::new(),
        };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("taskExecutionId"));
        assert!(json.contains("taskType"));
    }
}
