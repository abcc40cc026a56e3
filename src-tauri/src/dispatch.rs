use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::settings::Complexity;

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    Speech,
    Markdown,
}

impl ResponseFormat {
    pub fn for_tts(tts_enabled: bool) -> Self {
        if tts_enabled {
            ResponseFormat::Speech
        } else {
            ResponseFormat::Markdown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseFormat::Speech => "speech",
            ResponseFormat::Markdown => "markdown",
        }
    }
}

/// One question for the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: String,
    pub screenshot: Option<Vec<u8>>,
    pub complexity: Complexity,
    pub session_id: Option<String>,
    pub tts_enabled: bool,
}

impl QueryRequest {
    pub fn response_format(&self) -> ResponseFormat {
        ResponseFormat::for_tts(self.tts_enabled)
    }

    fn into_form(self) -> Result<Form, DispatchError> {
        let has_screenshot = self.screenshot.is_some();
        let format = self.response_format();
        let mut form = Form::new()
            .text("query", self.query)
            .text("complexity", self.complexity.as_str())
            .text("response_format", format.as_str())
            .text("has_screenshot", has_screenshot.to_string())
            .text("tts_enabled", self.tts_enabled.to_string());
        if let Some(session_id) = self.session_id {
            form = form.text("sessionId", session_id);
        }
        if let Some(png) = self.screenshot {
            let part = Part::bytes(png)
                .file_name("screenshot.png")
                .mime_str("image/png")
                .map_err(DispatchError::Transport)?;
            form = form.part("screenshot", part);
        }
        Ok(form)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid webhook URL `{0}`")]
    Endpoint(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("workflow returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl DispatchError {
    /// Text shown in place of a response.
    pub fn user_message(&self) -> String {
        format!("Error: {self}")
    }
}

/// What the overlay shows once a dispatch finishes. Never an error value:
/// failures arrive as displayable text with `failed` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub text: String,
    pub failed: bool,
}

impl DispatchOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            failed: false,
        }
    }

    pub fn failure(err: &DispatchError) -> Self {
        Self {
            text: err.user_message(),
            failed: true,
        }
    }
}

pub struct WorkflowClient {
    http: Client,
}

impl WorkflowClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub async fn send(&self, webhook_url: &str, request: QueryRequest) -> Result<String, DispatchError> {
        let url = Url::parse(webhook_url.trim())
            .map_err(|_| DispatchError::Endpoint(webhook_url.to_string()))?;
        debug!(
            %url,
            complexity = request.complexity.as_str(),
            screenshot = request.screenshot.is_some(),
            "dispatching query"
        );

        let form = request.into_form()?;
        let response = self.http.post(url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body: preview(&body),
            });
        }
        Ok(parse_response_body(&body))
    }

    pub async fn dispatch(&self, webhook_url: &str, request: QueryRequest) -> DispatchOutcome {
        match self.send(webhook_url, request).await {
            Ok(text) => DispatchOutcome::success(text),
            Err(err) => {
                warn!("dispatch failed: {err}");
                DispatchOutcome::failure(&err)
            }
        }
    }
}

/// Extracts the reply text: `output`, then `text`, otherwise the body itself.
pub fn parse_response_body(body: &str) -> String {
    let value = match serde_json::from_str::<Value>(body) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };
    // Workflow tools commonly wrap single items in an array.
    let item = match &value {
        Value::Array(items) if !items.is_empty() => &items[0],
        other => other,
    };
    match item {
        Value::Object(fields) => fields
            .get("output")
            .or_else(|| fields.get("text"))
            .map(|field| match field {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| item.to_string()),
        Value::String(text) => text.clone(),
        _ => body.to_string(),
    }
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Runs dispatches on the async runtime and reports back by callback.
#[derive(Clone)]
pub struct QueryDispatcher {
    client: Arc<WorkflowClient>,
    runtime: Handle,
}

impl QueryDispatcher {
    pub fn new(client: Arc<WorkflowClient>, runtime: Handle) -> Self {
        Self { client, runtime }
    }

    pub fn spawn<F>(&self, webhook_url: String, request: QueryRequest, on_done: F)
    where
        F: FnOnce(DispatchOutcome) + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        self.runtime.spawn(async move {
            let outcome = client.dispatch(&webhook_url, request).await;
            info!(failed = outcome.failed, "dispatch finished");
            on_done(outcome);
        });
    }
}
