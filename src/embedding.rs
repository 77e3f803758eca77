//! Embedding generation via the local embedding endpoint.
//!
//! One prompt per request, issued sequentially per job so the endpoint is
//! never overwhelmed. Transient failures are retried with exponential
//! backoff; the vector dimension is asserted across calls because the
//! vector store collection is fixed-dimension.

use crate::error::EmbeddingError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Per-request timeout against the endpoint.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Retry budget for transient failures.
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(16);

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Client for `POST {base_url}/api/embeddings`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    /// Dimension observed on the first successful call; 0 until then.
    dimension: AtomicUsize,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dimension: AtomicUsize::new(0),
            backoff_base: BACKOFF_BASE,
            backoff_cap: BACKOFF_CAP,
        }
    }

    /// Shrink the backoff schedule. Test hook.
    #[cfg(test)]
    fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// The model dimension, once at least one embedding has been produced.
    pub fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::Relaxed) {
            0 => None,
            dimension => Some(dimension),
        }
    }

    /// Embed one text, retrying transient failures with exponential backoff.
    pub async fn embed(&self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.embed_once(prompt).await {
                Ok(embedding) => return Ok(embedding),
                Err(EmbeddingError::Transient(reason)) if attempt < MAX_ATTEMPTS => {
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "embedding request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(EmbeddingError::Transient(reason)) => {
                    return Err(EmbeddingError::Permanent(format!(
                        "retry budget exhausted after {MAX_ATTEMPTS} attempts: {reason}"
                    )));
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Embed a batch sequentially, preserving order.
    pub async fn embed_batch(&self, prompts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut embeddings = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            embeddings.push(self.embed(prompt).await?);
        }
        Ok(embeddings)
    }

    async fn embed_once(&self, prompt: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt,
            })
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() || error.is_connect() {
                    EmbeddingError::Transient(error.to_string())
                } else {
                    EmbeddingError::Permanent(error.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(EmbeddingError::Transient(format!("endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(EmbeddingError::Permanent(format!("endpoint returned {status}")));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| EmbeddingError::Permanent(format!("malformed response: {error}")))?;

        if payload.embedding.is_empty() {
            return Err(EmbeddingError::Permanent("empty embedding".into()));
        }

        let expected = self.dimension.load(Ordering::Relaxed);
        if expected == 0 {
            self.dimension.store(payload.embedding.len(), Ordering::Relaxed);
        } else if payload.embedding.len() != expected {
            return Err(EmbeddingError::DimensionMismatch {
                expected,
                actual: payload.embedding.len(),
            });
        }

        Ok(payload.embedding)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_embedder(uri: &str) -> OllamaEmbedder {
        OllamaEmbedder::new(uri, "nomic-embed-text")
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn embeds_a_prompt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(json!({"model": "nomic-embed-text"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2, 0.3]})),
            )
            .mount(&server)
            .await;

        let embedder = test_embedder(&server.uri());
        let embedding = embedder.embed("hello").await.unwrap();
        assert_eq!(embedding, vec![0.1, 0.2, 0.3]);
        assert_eq!(embedder.dimension(), Some(3));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0]})))
            .mount(&server)
            .await;

        let embedder = test_embedder(&server.uri());
        let embedding = embedder.embed("hello").await.unwrap();
        assert_eq!(embedding, vec![1.0]);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let embedder = test_embedder(&server.uri());
        let error = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(error, EmbeddingError::Permanent(_)));
    }

    #[tokio::test]
    async fn dimension_mismatch_is_detected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2]})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1]})))
            .mount(&server)
            .await;

        let embedder = test_embedder(&server.uri());
        embedder.embed("first").await.unwrap();
        let error = embedder.embed("second").await.unwrap_err();
        assert!(matches!(
            error,
            EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .expect(5)
            .mount(&server)
            .await;

        let embedder = test_embedder(&server.uri());
        let error = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(error, EmbeddingError::Permanent(_)));
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let embedder = OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text");
        assert_eq!(embedder.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(embedder.backoff_delay(2), Duration::from_secs(1));
        assert_eq!(embedder.backoff_delay(3), Duration::from_secs(2));
        assert_eq!(embedder.backoff_delay(6), Duration::from_secs(16));
        assert_eq!(embedder.backoff_delay(12), Duration::from_secs(16));
    }
}
