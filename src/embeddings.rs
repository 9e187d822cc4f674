use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

/// Sentence-transformer used for chunks and queries
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_EMBEDDINGS_BASE_URL: &str = "http://127.0.0.1:8080/v1";
const EMBEDDING_BATCH_SIZE: usize = 32;

/// Representation of a vector embedding
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// A pretrained model that turns text into vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the model, recorded alongside persisted indexes
    fn model_name(&self) -> &str;

    /// Embed a search query
    async fn embed_query(&self, text: &str) -> Result<Embedding>;

    /// Embed many texts, preserving order
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed_query(text).await?);
        }
        Ok(embeddings)
    }
}

/// Configuration for an OpenAI-compatible embeddings API
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddingsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl OpenAiEmbeddingsConfig {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        OpenAiEmbeddingsConfig {
            base_url: base_url.unwrap_or_else(|| DEFAULT_EMBEDDINGS_BASE_URL.to_string()),
            api_key,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

/// Client for `POST {base}/embeddings`
#[derive(Clone)]
pub struct OpenAiEmbedder {
    config: OpenAiEmbeddingsConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(config: OpenAiEmbeddingsConfig) -> Self {
        let client = reqwest::Client::new();
        OpenAiEmbedder { config, client }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let request = EmbeddingsRequest {
            model: &self.config.model,
            input: texts,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach embeddings endpoint {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "API request failed: {} {}",
                status,
                error_text
            ));
        }

        let response_data: EmbeddingsResponse = response.json().await?;
        into_ordered_embeddings(response_data, texts.len())
    }
}

/// Servers may answer out of order; put results back in input order
fn into_ordered_embeddings(response: EmbeddingsResponse, expected: usize) -> Result<Vec<Embedding>> {
    if response.data.len() != expected {
        anyhow::bail!(
            "Embeddings response has {} vectors for {} inputs",
            response.data.len(),
            expected
        );
    }

    let mut items = response.data;
    items.sort_by_key(|item| item.index);

    Ok(items
        .into_iter()
        .map(|item| Embedding {
            values: item.embedding,
        })
        .collect())
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .context("Embeddings response was empty")
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(EMBEDDING_BATCH_SIZE).enumerate() {
            debug!(
                "Embedding batch {}/{}",
                i + 1,
                texts.len().div_ceil(EMBEDDING_BATCH_SIZE)
            );
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_reordered_by_index() {
        let response: EmbeddingsResponse = serde_json::from_str(
            r#"{"object":"list","data":[
                {"object":"embedding","index":1,"embedding":[0.0,1.0]},
                {"object":"embedding","index":0,"embedding":[1.0,0.0]}
            ],"model":"all-MiniLM-L6-v2"}"#,
        )
        .unwrap();

        let embeddings = into_ordered_embeddings(response, 2).unwrap();
        assert_eq!(embeddings[0].values, vec![1.0, 0.0]);
        assert_eq!(embeddings[1].values, vec![0.0, 1.0]);
        assert_eq!(embeddings[0].dimension(), 2);
    }

    #[test]
    fn test_count_mismatch_is_an_error() {
        let response = EmbeddingsResponse {
            data: vec![EmbeddingItem {
                index: 0,
                embedding: vec![1.0],
            }],
        };
        assert!(into_ordered_embeddings(response, 3).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = OpenAiEmbeddingsConfig::new(None, None);
        assert_eq!(config.base_url, "http://127.0.0.1:8080/v1");
        assert_eq!(config.model, "all-MiniLM-L6-v2");
    }
}
