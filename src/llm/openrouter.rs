//! OpenRouter API client implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{classify_http_status, LlmError, LlmErrorKind};
use super::{ChatMessage, Completion, CompletionRequest, LlmClient, TokenUsage, ToolCall, ToolDefinition};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client. One call per `complete`; retry policy lives with the caller.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, OPENROUTER_API_URL.to_string())
    }

    /// Create a client against a custom OpenAI-compatible endpoint.
    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            endpoint,
        }
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Create an LlmError from HTTP response status and body.
    fn create_error(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::InvalidRequest => LlmError::invalid_request(Some(status_code), body.to_string()),
            LlmErrorKind::Unavailable => LlmError::unavailable(Some(status_code), body.to_string()),
        }
    }

    fn build_request(request: &CompletionRequest) -> OpenRouterRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::new(super::Role::System, request.system_prompt.clone()));
        messages.extend(request.messages.iter().cloned());

        let tools = (!request.tools.is_empty()).then(|| request.tools.clone());
        OpenRouterRequest {
            model: request.model.clone(),
            messages,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }

    fn parse_response(body: &str, requested_model: &str) -> Result<Completion, LlmError> {
        let parsed: OpenRouterResponse = serde_json::from_str(body).map_err(|e| {
            LlmError::unavailable(None, format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::unavailable(None, "No choices in response"))?;

        Ok(Completion {
            content: choice.message.content.filter(|c| !c.trim().is_empty()),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.or_else(|| Some(requested_model.to_string())),
        })
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = Self::build_request(request);
        tracing::debug!(
            "Sending request to OpenRouter: model={}, messages={}, tools={}",
            request.model,
            body.messages.len(),
            request.tools.len()
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "devcrew")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::unavailable(None, format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::unavailable(None, format!("Connection failed: {}", e))
                } else {
                    LlmError::unavailable(None, format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(Self::create_error(status, &text, retry_after));
        }

        let completion = Self::parse_response(&text, &request.model)?;
        if let Some(usage) = completion.usage {
            tracing::debug!(
                "OpenRouter usage: prompt={} completion={}",
                usage.prompt_tokens,
                usage.completion_tokens
            );
        }
        Ok(completion)
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

/// Usage data (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}
