use crate::chunking::TextChunk;
use crate::embeddings::Embedding;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use qdrant_client::qdrant::{
    CountPointsBuilder, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use serde_json::json;

/// A chunk returned by a similarity search
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: TextChunk,
    /// Distance or similarity, depending on the store's metric
    pub score: f32,
}

/// Read side of a vector index, shared by the local index and Qdrant
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The `k` chunks closest to `query`, closest first
    async fn search(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>>;

    /// Number of stored chunks
    async fn count(&self) -> Result<usize>;
}

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
}

/// Client for interacting with Qdrant
#[derive(Clone)]
pub struct QdrantClient {
    client: std::sync::Arc<Qdrant>,
}

impl QdrantClient {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder.build()?;

        Ok(QdrantClient {
            client: std::sync::Arc::new(client),
        })
    }

    /// Check if a collection exists
    pub async fn collection_exists(&self, file_name: &str) -> Result<bool> {
        let collection_name = get_collection_name(file_name);

        match self.client.collection_info(&collection_name).await {
            Ok(_) => Ok(true),
            Err(qdrant_client::QdrantError::ResponseError { status })
                if status.code() == tonic::Code::NotFound =>
            {
                Ok(false)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to check collection existence: {}",
                e
            )),
        }
    }

    /// Create a new collection for a file
    pub async fn create_collection(&self, file_name: &str, vector_size: u64) -> Result<()> {
        let collection_name = get_collection_name(file_name);

        let create_collection = CreateCollectionBuilder::new(collection_name.clone())
            .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine));

        self.client
            .create_collection(create_collection)
            .await
            .with_context(|| format!("Failed to create collection {}", collection_name))?;

        Ok(())
    }

    /// Delete a collection
    pub async fn delete_collection(&self, file_name: &str) -> Result<()> {
        let collection_name = get_collection_name(file_name);

        self.client
            .delete_collection(collection_name.clone())
            .await
            .with_context(|| format!("Failed to delete collection {}", collection_name))?;

        Ok(())
    }

    /// Store chunks in the collection
    pub async fn store_chunks(
        &self,
        chunks: Vec<TextChunk>,
        embeddings: Vec<Embedding>,
        file_name: &str,
    ) -> Result<()> {
        if chunks.len() != embeddings.len() {
            anyhow::bail!(
                "Got {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }
        let collection_name = get_collection_name(file_name);

        let points = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let payload = Payload::try_from(json!({
                    "text": chunk.text,
                    "document_id": chunk.document_id,
                    "page": chunk.page,
                    "chunk_index": chunk.chunk_index,
                    "start_position": chunk.start_position,
                }))?;

                Ok(PointStruct::new(
                    chunk.chunk_index as u64,
                    embedding.values,
                    payload,
                ))
            })
            .collect::<Result<Vec<PointStruct>>>()?;

        let count = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection_name.clone(), points).wait(true))
            .await
            .with_context(|| {
                format!("Failed to upsert points in collection {}", collection_name)
            })?;

        info!("Stored {} points in {}", count, collection_name);
        Ok(())
    }

    /// Count the points in a collection
    pub async fn count(&self, file_name: &str) -> Result<usize> {
        let collection_name = get_collection_name(file_name);

        let response = self
            .client
            .count(CountPointsBuilder::new(collection_name.clone()).exact(true))
            .await
            .with_context(|| format!("Failed to count points in {}", collection_name))?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    /// Search for relevant chunks
    pub async fn search(
        &self,
        query_embedding: &Embedding,
        file_name: &str,
        limit: u64,
    ) -> Result<Vec<ScoredChunk>> {
        let collection_name = get_collection_name(file_name);

        let search_request = SearchPointsBuilder::new(
            collection_name.clone(),
            query_embedding.values.clone(),
            limit,
        )
        .with_payload(true);

        let search_response = self
            .client
            .search_points(search_request)
            .await
            .with_context(|| format!("Failed to search collection {}", collection_name))?;

        // Convert search results back to TextChunks
        let chunks = search_response
            .result
            .into_iter()
            .filter_map(|scored_point| {
                let payload = scored_point.payload;
                let text = payload.get("text")?.as_str()?;
                let document_id = payload
                    .get("document_id")
                    .and_then(|v| v.as_str())
                    .cloned()
                    .unwrap_or_else(|| file_name.to_string());
                let number = |key: &str| {
                    payload
                        .get(key)
                        .and_then(|v| v.as_integer())
                        .map(|v| v as usize)
                        .unwrap_or(0)
                };

                Some(ScoredChunk {
                    chunk: TextChunk {
                        text: text.to_string(),
                        document_id,
                        page: number("page"),
                        chunk_index: number("chunk_index"),
                        start_position: number("start_position"),
                    },
                    score: scored_point.score,
                })
            })
            .collect();

        Ok(chunks)
    }
}

/// A single document's collection seen through [`VectorStore`]
pub struct QdrantCollection {
    client: QdrantClient,
    document_id: String,
}

impl QdrantCollection {
    pub fn new(client: QdrantClient, document_id: impl Into<String>) -> Self {
        QdrantCollection {
            client,
            document_id: document_id.into(),
        }
    }
}

#[async_trait]
impl VectorStore for QdrantCollection {
    async fn search(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.client.search(query, &self.document_id, k as u64).await
    }

    async fn count(&self) -> Result<usize> {
        self.client.count(&self.document_id).await
    }
}

/// Generate a collection name from a file name
fn get_collection_name(file_name: &str) -> String {
    // Replace non-alphanumeric characters with underscores and convert to lowercase
    let name = file_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_lowercase();

    format!("rag_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name() {
        assert_eq!(get_collection_name("Bhagavad Gita.pdf"), "rag_bhagavad_gita_pdf");
        assert_eq!(get_collection_name("gita-v2.txt"), "rag_gita_v2_txt");
    }
}
