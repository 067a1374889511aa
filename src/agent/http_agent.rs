//! Agent reached over HTTP
//!
//! Each call POSTs `{"input": ..., "context": ...}` to the configured URL. A 2xx
//! JSON body is the output; other statuses map to error codes.

use super::types::{Agent, AgentContext, AgentError, parse_output};
use crate::config::AgentConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpAgent {
    name: String,

    url: String,

    headers: Vec<(String, String)>,

    timeout: Duration,

    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CallRequest<'a> {
    input: &'a Value,
    context: &'a AgentContext,
}

/// Error body an agent may return, either flat or under `error`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<Box<ErrorBody>>,
}

impl HttpAgent {
    pub fn from_config(name: impl Into<String>, config: &AgentConfig) -> Result<Self, AgentError> {
        let mut headers: Vec<(String, String)> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        let mut agent =
            Self::new(name, config.command.clone())?.with_timeout(Duration::from_secs(config.timeout));
        agent.headers = headers;
        Ok(agent)
    }

    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AgentError::unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            headers: Vec::new(),
            timeout: Duration::from_secs(300),
            client,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Map a non-success status and body to an agent error
    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> AgentError {
        let (code, retryable) = match status.as_u16() {
            401 | 403 => ("AUTH_FAILED", false),
            404 => ("AGENT_UNAVAILABLE", false),
            408 | 504 => ("TIMEOUT", true),
            429 => ("RATE_LIMITED", true),
            400..=499 => ("REQUEST_REJECTED", false),
            500..=599 => ("UPSTREAM_ERROR", true),
            _ => ("HTTP_ERROR", false),
        };

        let reported = serde_json::from_str::<ErrorBody>(body).ok().map(|b| match b.error {
            Some(inner) => *inner,
            None => b,
        });

        match reported {
            Some(ErrorBody {
                code: Some(agent_code),
                message,
                ..
            }) => AgentError::new(
                agent_code,
                message.unwrap_or_else(|| format!("HTTP {}", status)),
            ),
            Some(ErrorBody {
                message: Some(message),
                ..
            }) => AgentError::new(code, format!("HTTP {}: {}", status, message)),
            _ => AgentError::new(code, format!("HTTP {}: {}", status, body.trim())),
        }
        .with_retryable(retryable)
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn call(&self, input: &Value, context: &AgentContext) -> Result<Value, AgentError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .header("x-correlation-id", &context.correlation_id)
            .header("x-request-id", &context.request_id)
            .json(&CallRequest { input, context });

        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        tracing::debug!(agent = %self.name, url = %self.url, step = %context.step_id, "Calling agent");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::timeout(self.timeout)
            } else if e.is_connect() {
                AgentError::network(format!("connection failed: {}", e))
            } else {
                AgentError::network(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::network(format!("failed to read response: {}", e)))?;

        if status.is_success() {
            Ok(parse_output(&body))
        } else {
            Err(self.map_http_error(status, &body))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
