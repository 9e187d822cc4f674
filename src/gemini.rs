use crate::embeddings::{Embedder, Embedding};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const GEMINI_EMBEDDING_MODEL: &str = "models/text-embedding-004";
const DEFAULT_GEMINI_EMBEDDINGS_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent";
/// Most requests `batchEmbedContents` accepts at once
const BATCH_SIZE: usize = 100;

/// Configuration for Gemini API
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub embeddings_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: String, embeddings_url: Option<String>) -> Self {
        GeminiConfig {
            api_key,
            embeddings_url: embeddings_url
                .unwrap_or_else(|| DEFAULT_GEMINI_EMBEDDINGS_URL.to_string()),
        }
    }
}

/// Client for the Gemini embedding API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::new();
        GeminiClient { config, client }
    }

    async fn post<T: Serialize, R: DeserializeOwned>(&self, url: &str, body: &T) -> Result<R> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Gemini request failed: {} {}", status, error_text);
        }

        response
            .json()
            .await
            .context("Failed to decode Gemini embedding response")
    }
}

/// `...:embedContent` becomes `...:batchEmbedContents`
fn batch_url(embeddings_url: &str) -> Result<String> {
    embeddings_url
        .strip_suffix(":embedContent")
        .map(|base| format!("{}:batchEmbedContents", base))
        .with_context(|| format!("Cannot derive batch endpoint from {}", embeddings_url))
}

fn content_request(text: &str) -> ContentRequest<'_> {
    ContentRequest {
        model: GEMINI_EMBEDDING_MODEL,
        content: Content {
            parts: vec![Part { text }],
        },
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    fn model_name(&self) -> &str {
        GEMINI_EMBEDDING_MODEL
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        let response: SingleResponse = self
            .post(&self.config.embeddings_url, &content_request(text))
            .await?;
        Ok(Embedding {
            values: response.embedding.values,
        })
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let url = batch_url(&self.config.embeddings_url)?;
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(BATCH_SIZE) {
            let request = BatchRequest {
                requests: batch.iter().map(|text| content_request(text)).collect(),
            };
            let response: BatchResponse = self.post(&url, &request).await?;
            if response.embeddings.len() != batch.len() {
                anyhow::bail!(
                    "Gemini returned {} embeddings for {} texts",
                    response.embeddings.len(),
                    batch.len()
                );
            }
            debug!("Embedded batch of {} chunks", batch.len());
            embeddings.extend(
                response
                    .embeddings
                    .into_iter()
                    .map(|data| Embedding { values: data.values }),
            );
        }

        Ok(embeddings)
    }
}

#[derive(Serialize)]
struct ContentRequest<'a> {
    model: &'static str,
    content: Content<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    requests: Vec<ContentRequest<'a>>,
}

#[derive(Deserialize, Debug)]
struct SingleResponse {
    embedding: Values,
}

#[derive(Deserialize, Debug)]
struct BatchResponse {
    #[serde(default)]
    embeddings: Vec<Values>,
}

#[derive(Deserialize, Debug)]
struct Values {
    values: Vec<f32>,
}
