//! OpenRouter (OpenAI-compatible) chat completions gateway.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::{LlmError, LlmErrorKind, TransportRetry};
use super::{ChatMessage, Completion, ModelGateway, TokenUsage, ToolCall, ToolDefinition};

pub const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Provider phrasings for prompts that overflow the context window.
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context length",
    "context_length_exceeded",
    "maximum context",
    "too many tokens",
];

pub struct OpenRouterGateway {
    client: Client,
    api_key: String,
    model: String,
    api_url: String,
    retry: TransportRetry,
}

impl OpenRouterGateway {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            api_url: OPENROUTER_API_URL.to_string(),
            retry: TransportRetry::default(),
        }
    }

    /// Point the gateway at another OpenAI-compatible endpoint.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_transport_retry(mut self, retry: TransportRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn retry_after(headers: &HeaderMap) -> Option<Duration> {
        let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
        Some(Duration::from_secs(seconds))
    }

    /// Classify a non-success response. Overflow messages win over the status.
    fn classify(status: u16, body: &str, retry_after: Option<Duration>) -> LlmError {
        let lower = body.to_lowercase();
        if CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m)) {
            return LlmError::context_exceeded(body.to_string()).with_status(status);
        }
        LlmError::from_http(status, body).with_retry_after(retry_after)
    }

    fn transport_error(e: reqwest::Error) -> LlmError {
        let what = if e.is_timeout() {
            "timed out"
        } else if e.is_connect() {
            "connection failed"
        } else {
            "request failed"
        };
        LlmError::network_error(format!("{}: {}", what, e))
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> Result<Completion, LlmError> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "taskweave")
            .json(request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        let retry_after = Self::retry_after(response.headers());
        let body = response.text().await.map_err(Self::transport_error)?;
        if !status.is_success() {
            return Err(Self::classify(status.as_u16(), &body, retry_after));
        }

        let parsed: ChatResponseBody = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("invalid completion body ({}): {}", e, body))
        })?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(LlmError::parse_error("completion has no choices".to_string()));
        };
        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }
}

#[async_trait]
impl ModelGateway for OpenRouterGateway {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            tool_choice: tools.map(|_| "auto"),
            tools,
        };
        debug!(model = %self.model, messages = messages.len(), "Sending completion request");

        let started = Instant::now();
        let mut retry = 0;
        loop {
            let error = match self.send_once(&request).await {
                Ok(completion) => {
                    if retry > 0 {
                        info!("Completion succeeded after {} retries ({:?})", retry, started.elapsed());
                    }
                    return Ok(completion);
                }
                Err(error) => error,
            };

            let remaining = self.retry.deadline.saturating_sub(started.elapsed());
            let delay = match self.retry.delay(retry, &error) {
                Some(delay) if delay < remaining => delay,
                _ => {
                    warn!("Completion failed after {} retries: {}", retry, error);
                    return Err(error);
                }
            };
            if error.kind == LlmErrorKind::RateLimited {
                warn!("Rate limited by {}, waiting {:?}", self.model, delay);
            } else {
                warn!("Retrying completion in {:?}: {}", delay, error);
            }
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    prompt_tokens: u64,
    completion_tokens: u64,
}
