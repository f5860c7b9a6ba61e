//! Embedding providers and the batching stage
//!
//! Texts go out in fixed-size batches, one request at a time. Empty texts are
//! dropped per batch and every returned vector stays tagged with the index of
//! the text it belongs to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ai_client::{check_status, http_client};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::settings::{EmbeddingBackend, Settings};
use crate::utils::safe_truncate;

/// Roughly 8000 tokens
const MAX_INPUT_BYTES: usize = 30000;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per input text, in input order
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Build the provider selected in settings
pub fn from_settings(settings: &Settings) -> Result<Box<dyn EmbeddingProvider>> {
    let model = settings.embedding_model();
    match settings.embedding_backend {
        EmbeddingBackend::OpenAi => {
            let key = settings
                .openai_api_key()
                .ok_or_else(|| Error::Config("OPENAI_API_KEY not set".to_string()))?;
            Ok(Box::new(OpenAiEmbeddings::new(key, model)?))
        }
        EmbeddingBackend::Ollama => Ok(Box::new(OllamaEmbeddings::new(settings.ollama_url(), model)?)),
    }
}

/// Embed `texts` in batches of `batch_size`. Returns `(text index, vector)`
/// pairs in input order; empty texts have no entry. Any failed batch fails
/// the whole call.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    policy: &RetryPolicy,
) -> Result<Vec<(usize, Vec<f32>)>> {
    embed_in_batches_with_progress(provider, texts, batch_size, policy, |_, _| {}).await
}

/// Same as [`embed_in_batches`], calling `on_batch(done, total)` after each
/// batch
pub async fn embed_in_batches_with_progress<F>(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    batch_size: usize,
    policy: &RetryPolicy,
    mut on_batch: F,
) -> Result<Vec<(usize, Vec<f32>)>>
where
    F: FnMut(usize, usize),
{
    let batch_size = batch_size.max(1);
    let total_batches = texts.len().div_ceil(batch_size);
    let mut results: Vec<(usize, Vec<f32>)> = Vec::with_capacity(texts.len());
    let mut dimension: Option<usize> = None;

    for (batch_idx, chunk) in texts.chunks(batch_size).enumerate() {
        let offset = batch_idx * batch_size;
        let (indices, batch): (Vec<usize>, Vec<String>) = chunk
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.trim().is_empty())
            .map(|(i, t)| (offset + i, t.clone()))
            .unzip();

        if batch.is_empty() {
            tracing::debug!(batch = batch_idx + 1, "Skipping batch with only empty texts");
            on_batch(batch_idx + 1, total_batches);
            continue;
        }

        let label = format!("embedding batch {}/{}", batch_idx + 1, total_batches);
        let vectors = retry_with_backoff(policy, &label, |_| provider.embed(&batch)).await?;

        if vectors.len() != batch.len() {
            return Err(Error::EmbeddingCountMismatch {
                requested: batch.len(),
                received: vectors.len(),
            });
        }

        for (idx, vector) in indices.into_iter().zip(vectors) {
            let dim = *dimension.get_or_insert(vector.len());
            if vector.len() != dim {
                return Err(Error::Provider(format!(
                    "Embedding dimension changed from {} to {} at text {}",
                    dim,
                    vector.len(),
                    idx
                )));
            }
            results.push((idx, vector));
        }

        tracing::debug!(
            batch = batch_idx + 1,
            total_batches,
            embedded = results.len(),
            "Embedded batch"
        );
        on_batch(batch_idx + 1, total_batches);
    }

    Ok(results)
}

// ==================== OpenAI ====================

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

/// OpenAI embeddings API response format
#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Ok(Self { client: http_client()?, api_key, model })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = OpenAiEmbeddingRequest {
            model: &self.model,
            input: batch.iter().map(|t| safe_truncate(t, MAX_INPUT_BYTES)).collect(),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "OpenAI embedding").await?;

        let api_response: OpenAiEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse embedding response: {}", e)))?;

        Ok(order_by_index(api_response.data))
    }
}

/// The API tags each vector with its input index; don't rely on array order
fn order_by_index(mut data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    data.sort_by_key(|d| d.index);
    data.into_iter().map(|d| d.embedding).collect()
}

// ==================== Ollama ====================

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Local embeddings through an Ollama server's `/api/embed`
pub struct OllamaEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbeddings {
    pub fn new(base_url: String, model: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = OllamaEmbedRequest {
            model: &self.model,
            input: batch.iter().map(|t| safe_truncate(t, MAX_INPUT_BYTES)).collect(),
        };

        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "Ollama embedding").await?;

        let api_response: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Provider(format!("Failed to parse Ollama embed response: {}", e)))?;

        Ok(api_response.embeddings)
    }
}
