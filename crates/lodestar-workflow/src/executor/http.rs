//! HTTP task executor.
//!
//! Configuration keys: `url` (required), `method`, `headers` (JSON object
//! of string pairs), `body`. Variable substitution applies to all of them.
//! A non-2xx response is not an executor error; it is reported through the
//! `success` and `statusCode` outputs and the task still completes.

use crate::context::ExecutionContext;
use crate::definition::TaskDefinition;
use crate::error::{WorkflowError, WorkflowResult};
use crate::executor::{ExecutorSupport, TaskExecutor, SUCCESS_KEY};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Output key carrying the raw response body.
pub const RESPONSE_KEY: &str = "response";

/// Output key carrying the numeric response status.
pub const STATUS_CODE_KEY: &str = "statusCode";

/// Output key carrying the body parsed as JSON, when it parses.
pub const PARSED_RESPONSE_KEY: &str = "parsedResponse";

/// Task executor issuing one HTTP request per attempt.
pub struct HttpTaskExecutor {
    client: Client,
    support: ExecutorSupport,
}

impl Default for HttpTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTaskExecutor {
    /// Creates an executor with a default client.
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            support: ExecutorSupport::new().require("url"),
        }
    }

    /// Creates an executor with a custom client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            support: ExecutorSupport::new().require("url"),
        }
    }

    fn parse_method(config: &HashMap<String, String>) -> WorkflowResult<Method> {
        let raw = config.get("method").map(String::as_str).unwrap_or("GET");
        Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
            .map_err(|_| WorkflowError::Validation(format!("invalid HTTP method '{}'", raw)))
    }

    fn parse_headers(
        config: &HashMap<String, String>,
    ) -> WorkflowResult<Vec<(String, String)>> {
        let Some(raw) = config.get("headers") else {
            return Ok(Vec::new());
        };

        let value: Value = serde_json::from_str(raw)
            .map_err(|e| WorkflowError::Validation(format!("invalid headers JSON: {}", e)))?;
        let object = value.as_object().ok_or_else(|| {
            WorkflowError::Validation("headers must be a JSON object".to_string())
        })?;

        let mut headers = Vec::with_capacity(object.len());
        for (name, value) in object {
            let value = value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            headers.push((name.clone(), value));
        }
        Ok(headers)
    }
}

#[async_trait]
impl TaskExecutor for HttpTaskExecutor {
    fn task_type(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        definition: &TaskDefinition,
        context: &ExecutionContext,
    ) -> WorkflowResult<HashMap<String, Value>> {
        let config = self.support.prepare(definition, context)?;

        let url = config["url"].clone();
        let method = Self::parse_method(&config)?;
        let headers = Self::parse_headers(&config)?;

        debug!("Dispatching {} {} for task '{}'", method, url, definition.name);

        let mut request = self.client.request(method, &url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = config.get("body") {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| {
            WorkflowError::TaskExecutionFailed {
                task: definition.name.clone(),
                reason: format!("request error: {}", e),
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| WorkflowError::TaskExecutionFailed {
                task: definition.name.clone(),
                reason: format!("error reading response body: {}", e),
            })?;

        let mut outputs = HashMap::new();
        outputs.insert(SUCCESS_KEY.to_string(), Value::Bool(status.is_success()));
        outputs.insert(
            STATUS_CODE_KEY.to_string(),
            Value::Number(status.as_u16().into()),
        );
        outputs.insert(RESPONSE_KEY.to_string(), Value::String(body.clone()));
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            outputs.insert(PARSED_RESPONSE_KEY.to_string(), parsed);
        }
        if !status.is_success() {
            outputs.insert(
                "error".to_string(),
                Value::String(format!("HTTP status {}", status.as_u16())),
            );
        }

        Ok(self.support.finalize(outputs))
    }
}
