//! Chat-completion boundary used for answer synthesis.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const DEFAULT_MAX_TOKENS: u32 = 700;
const DEFAULT_TEMPERATURE: f32 = 0.65;

/// Errors crossing the chat-completion boundary.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// Transient failures persisted through every allowed attempt.
    #[error("chat completion for model '{model}' failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        model: String,
        attempts: usize,
        reason: String,
    },

    /// The service answered with a non-retryable error status.
    #[error("chat completion rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// A success response carried no usable message.
    #[error("chat completion returned no choices")]
    EmptyResponse,

    /// Request could not be built or sent at all.
    #[error("chat completion transport error: {0}")]
    Transport(String),
}

/// A chat-completion backend: one prompt in, one answer text out.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Identifier of the chat model.
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, SynthesisError>;
}

/// Async chat-completions client for OpenAI-compatible endpoints.
pub struct RemoteCompletionClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_attempts: usize,
    backoff_base: Duration,
}

impl RemoteCompletionClient {
    pub fn builder() -> RemoteCompletionClientBuilder {
        RemoteCompletionClientBuilder::default()
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
    }

    fn backoff(&self, attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        self.backoff_base * (1u32 << capped)
    }
}

#[async_trait]
impl CompletionProvider for RemoteCompletionClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, SynthesisError> {
        let request = CompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&self.endpoint).json(&request).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: CompletionResponse = resp.json().await.map_err(|err| {
                            SynthesisError::Transport(format!(
                                "failed to parse completion response: {err}"
                            ))
                        })?;
                        let answer = parsed
                            .choices
                            .into_iter()
                            .next()
                            .map(|choice| choice.message.content)
                            .ok_or(SynthesisError::EmptyResponse)?;
                        return Ok(answer.trim().to_string());
                    }

                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if Self::should_retry(status) {
                        if attempt + 1 < self.max_attempts {
                            attempt += 1;
                            tracing::debug!(%status, attempt, "retrying completion request");
                            tokio::time::sleep(self.backoff(attempt)).await;
                            continue;
                        }
                        return Err(SynthesisError::RetriesExhausted {
                            model: self.model.clone(),
                            attempts: attempt + 1,
                            reason: format!("{status}: {body}"),
                        });
                    }
                    return Err(SynthesisError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if Self::is_retryable_error(&err) && attempt + 1 < self.max_attempts {
                        attempt += 1;
                        tracing::debug!(error = %err, attempt, "retrying completion request");
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    return Err(SynthesisError::RetriesExhausted {
                        model: self.model.clone(),
                        attempts: attempt + 1,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Builder for [`RemoteCompletionClient`].
#[derive(Debug, Default)]
pub struct RemoteCompletionClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout: Option<Duration>,
    max_attempts: Option<usize>,
    backoff_base: Option<Duration>,
}

impl RemoteCompletionClientBuilder {
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Base URL of the service, e.g. `https://api.openai.com/v1`.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// First retry delay; doubles per attempt. Shrink it in tests.
    #[must_use]
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn build(self) -> Result<RemoteCompletionClient, SynthesisError> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| SynthesisError::Transport("missing API key".into()))?;
        let model = self
            .model
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| SynthesisError::Transport("missing model name".into()))?;
        let base_url = self
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| SynthesisError::Transport("invalid API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .default_headers(headers)
            .use_rustls_tls()
            .build()
            .map_err(|err| {
                SynthesisError::Transport(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(RemoteCompletionClient {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
        })
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}
