//! OpenAI-compatible embeddings client.
//!
//! Thin boundary component: bounded batches, transient-failure retry with
//! exponential backoff, and order/count validation of the response. The
//! algorithmic core only ever sees this through [`EmbeddingProvider`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use super::{EmbeddingProvider, EmbeddingServiceError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Async embeddings client for OpenAI-compatible endpoints.
pub struct RemoteEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    send_dimensions: bool,
    max_attempts: usize,
    batch_size: usize,
    backoff_base: Duration,
}

impl RemoteEmbeddingClient {
    pub fn builder() -> RemoteEmbeddingClientBuilder {
        RemoteEmbeddingClientBuilder::default()
    }

    /// Maximum batch size this client will accept per call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
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
impl EmbeddingProvider for RemoteEmbeddingClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() > self.batch_size {
            return Err(EmbeddingServiceError::Transport(format!(
                "batch of {} exceeds configured max {}",
                texts.len(),
                self.batch_size
            )));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.send_dimensions.then_some(self.dimensions),
        };

        let mut attempt = 0usize;
        loop {
            let response = self.client.post(&self.endpoint).json(&request).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp.json().await.map_err(|err| {
                            EmbeddingServiceError::Transport(format!(
                                "failed to parse embedding response: {err}"
                            ))
                        })?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != texts.len() {
                            return Err(EmbeddingServiceError::CountMismatch {
                                expected: texts.len(),
                                returned: parsed.data.len(),
                            });
                        }
                        return Ok(parsed
                            .data
                            .into_iter()
                            .map(|entry| entry.embedding)
                            .collect());
                    }

                    let body = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if Self::should_retry(status) {
                        if attempt + 1 < self.max_attempts {
                            attempt += 1;
                            tracing::debug!(%status, attempt, "retrying embedding request");
                            tokio::time::sleep(self.backoff(attempt)).await;
                            continue;
                        }
                        return Err(EmbeddingServiceError::RetriesExhausted {
                            model: self.model.clone(),
                            attempts: attempt + 1,
                            reason: format!("{status}: {body}"),
                        });
                    }
                    return Err(EmbeddingServiceError::Rejected {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if Self::is_retryable_error(&err) && attempt + 1 < self.max_attempts {
                        attempt += 1;
                        tracing::debug!(error = %err, attempt, "retrying embedding request");
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    return Err(EmbeddingServiceError::RetriesExhausted {
                        model: self.model.clone(),
                        attempts: attempt + 1,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Builder for [`RemoteEmbeddingClient`].
#[derive(Debug, Default)]
pub struct RemoteEmbeddingClientBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    dimensions: Option<usize>,
    send_dimensions: bool,
    timeout: Option<Duration>,
    max_attempts: Option<usize>,
    batch_size: Option<usize>,
    backoff_base: Option<Duration>,
}

impl RemoteEmbeddingClientBuilder {
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

    /// Vector dimensionality the model produces.
    #[must_use]
    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Ask the service to truncate vectors to the configured dimensionality
    /// (supported by the v3 embedding model family).
    #[must_use]
    pub fn request_dimensions(mut self, send: bool) -> Self {
        self.send_dimensions = send;
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

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// First retry delay; doubles per attempt. Shrink it in tests.
    #[must_use]
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn build(self) -> Result<RemoteEmbeddingClient, EmbeddingServiceError> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| EmbeddingServiceError::Transport("missing API key".into()))?;
        let model = self
            .model
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| EmbeddingServiceError::Transport("missing model name".into()))?;
        let dimensions = self
            .dimensions
            .filter(|dims| *dims > 0)
            .ok_or_else(|| EmbeddingServiceError::Transport("missing dimensions".into()))?;
        let base_url = self
            .base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbeddingServiceError::Transport("invalid API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .default_headers(headers)
            .use_rustls_tls()
            .build()
            .map_err(|err| {
                EmbeddingServiceError::Transport(format!("failed to build HTTP client: {err}"))
            })?;

        Ok(RemoteEmbeddingClient {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model,
            dimensions,
            send_dimensions: self.send_dimensions,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            backoff_base: self.backoff_base.unwrap_or(DEFAULT_BACKOFF_BASE),
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_client(server: &MockServer, max_attempts: usize) -> RemoteEmbeddingClient {
        RemoteEmbeddingClient::builder()
            .api_key("test-key")
            .base_url(server.base_url())
            .model("test-embedder")
            .dimensions(3)
            .max_attempts(max_attempts)
            .backoff_base(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn embeds_a_batch_in_input_order() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(serde_json::json!({
                    "data": [
                        { "index": 1, "embedding": [0.0, 1.0, 0.0] },
                        { "index": 0, "embedding": [1.0, 0.0, 0.0] }
                    ]
                }));
            })
            .await;

        let client = test_client(&server, 3);
        let vectors = client
            .embed_batch(&["first".into(), "second".into()])
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(vectors, vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]);
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(503).body("overloaded");
            })
            .await;

        let client = test_client(&server, 3);
        let err = client.embed_batch(&["text".into()]).await.unwrap_err();

        assert_eq!(mock.hits_async().await, 3);
        assert!(matches!(
            err,
            EmbeddingServiceError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(400).body("bad request");
            })
            .await;

        let client = test_client(&server, 3);
        let err = client.embed_batch(&["text".into()]).await.unwrap_err();

        assert_eq!(mock.hits_async().await, 1);
        assert!(matches!(
            err,
            EmbeddingServiceError::Rejected { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn oversized_batches_are_refused_locally() {
        let server = MockServer::start_async().await;
        let client = RemoteEmbeddingClient::builder()
            .api_key("test-key")
            .base_url(server.base_url())
            .model("test-embedder")
            .dimensions(3)
            .batch_size(1)
            .build()
            .unwrap();

        let err = client
            .embed_batch(&["a".into(), "b".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, EmbeddingServiceError::Transport(_)));
    }
}
