//! HTTP processor: hands each task to the ingestion service.

use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_parse, env_required};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use task_queue::{ErrorCategory, ProcessError, Task, TaskProcessor};
use tracing::debug;

/// Processor endpoint settings.
#[derive(Debug, Clone)]
pub struct HttpProcessorConfig {
    /// Endpoint receiving `POST {task}`
    pub url: String,
    pub timeout: Duration,
}

impl HttpProcessorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl FromEnv for HttpProcessorConfig {
    /// - `INGEST_PROCESSOR_URL` (required)
    /// - `INGEST_PROCESSOR_TIMEOUT_SECS` (default 60)
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("INGEST_PROCESSOR_URL")?;
        let timeout = env_parse("INGEST_PROCESSOR_TIMEOUT_SECS", 60u64)?;
        Ok(Self::new(url).with_timeout(Duration::from_secs(timeout)))
    }
}

/// POSTs the task record as JSON; a 2xx JSON body becomes the task result.
pub struct HttpProcessor {
    config: HttpProcessorConfig,
    client: Client,
}

impl HttpProcessor {
    pub fn new(config: HttpProcessorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }
}

/// Timeouts, throttling and server errors are worth another attempt.
pub fn classify_status(status: StatusCode) -> ErrorCategory {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Permanent
    }
}

#[async_trait]
impl TaskProcessor for HttpProcessor {
    async fn process(&self, task: &Task) -> Result<Value, ProcessError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(task)
            .send()
            .await
            .map_err(|e| ProcessError::transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| ProcessError::transient(format!("failed to read response: {}", e)))?;
            debug!(task_id = %task.task_id, status = %status, "Processor accepted task");

            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| ProcessError::permanent(format!("invalid result body: {}", e)));
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("processor returned {}: {}", status, body.trim());
        Err(match classify_status(status) {
            ErrorCategory::Transient => ProcessError::transient(message),
            ErrorCategory::Permanent => ProcessError::permanent(message),
        })
    }

    fn name(&self) -> &'static str {
        "HttpProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use chrono::Utc;
    use serde_json::json;
    use task_queue::{NewTask, TaskPayload};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/ingest", addr)
    }

    fn task() -> Task {
        NewTask::new(TaskPayload::json(json!({"doc": "a.pdf"})))
            .with_id("t1")
            .into_task(3, Utc::now())
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), ErrorCategory::Transient);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorCategory::Transient);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), ErrorCategory::Transient);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), ErrorCategory::Permanent);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorCategory::Permanent);
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("INGEST_PROCESSOR_URL", Some("http://ingest:8080/run")),
                ("INGEST_PROCESSOR_TIMEOUT_SECS", Some("15")),
            ],
            || {
                let config = HttpProcessorConfig::from_env().unwrap();
                assert_eq!(config.url, "http://ingest:8080/run");
                assert_eq!(config.timeout, Duration::from_secs(15));
            },
        );

        temp_env::with_var_unset("INGEST_PROCESSOR_URL", || {
            assert!(HttpProcessorConfig::from_env().is_err());
        });
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let url = serve(Router::new().route(
            "/ingest",
            post(|Json(task): Json<Value>| async move { Json(json!({"echo": task["task_id"]})) }),
        ))
        .await;

        let processor = HttpProcessor::new(HttpProcessorConfig::new(url)).unwrap();
        let result = processor.process(&task()).await.unwrap();
        assert_eq!(result, json!({"echo": "t1"}));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let url = serve(Router::new().route(
            "/ingest",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "embedding backlog") }),
        ))
        .await;

        let processor = HttpProcessor::new(HttpProcessorConfig::new(url)).unwrap();
        let err = processor.process(&task()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message.contains("embedding backlog"));
    }

    #[tokio::test]
    async fn test_client_error_is_permanent() {
        let url = serve(Router::new().route(
            "/ingest",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "unsupported format") }),
        ))
        .await;

        let processor = HttpProcessor::new(HttpProcessorConfig::new(url)).unwrap();
        let err = processor.process(&task()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
