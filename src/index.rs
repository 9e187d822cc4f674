use crate::chunking::TextChunk;
use crate::database::{ScoredChunk, VectorStore};
use crate::embeddings::Embedding;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const INDEX_FORMAT_VERSION: u32 = 1;
const VECTORS_FILE: &str = "index.bin";
const MANIFEST_FILE: &str = "index.json";

/// How closeness between two vectors is measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    /// Squared euclidean distance, lower is closer
    #[default]
    L2,
    /// Cosine similarity, higher is closer
    Cosine,
}

impl Distance {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Distance::Cosine => cosine_similarity(a, b),
        }
    }

    fn closest_first(self, a: f32, b: f32) -> std::cmp::Ordering {
        match self {
            Distance::L2 => a.total_cmp(&b),
            Distance::Cosine => b.total_cmp(&a),
        }
    }
}

/// Exact nearest-neighbour index kept in memory and persisted as two files
#[derive(Debug, Clone)]
pub struct FlatIndex {
    model: String,
    distance: Distance,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<TextChunk>,
}

#[derive(Serialize, Deserialize)]
struct StoredVectors {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct IndexManifest {
    version: u32,
    model: String,
    distance: Distance,
    dimension: usize,
    chunks: Vec<TextChunk>,
}

impl FlatIndex {
    pub fn new(model: impl Into<String>, distance: Distance) -> Self {
        FlatIndex {
            model: model.into(),
            distance,
            dimension: 0,
            vectors: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Embedding model the vectors were produced with
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Add chunks with their embeddings; the first vector fixes the dimension
    pub fn add(&mut self, chunks: Vec<TextChunk>, embeddings: Vec<Embedding>) -> Result<()> {
        if chunks.len() != embeddings.len() {
            anyhow::bail!(
                "Got {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }

        let dimension = match (self.dimension, embeddings.first()) {
            (0, Some(first)) => first.dimension(),
            (current, _) => current,
        };
        if let Some(bad) = embeddings.iter().find(|e| e.dimension() != dimension) {
            anyhow::bail!(
                "Vector dimension mismatch: index has {}, got {}",
                dimension,
                bad.dimension()
            );
        }

        self.dimension = dimension;
        self.vectors
            .extend(embeddings.into_iter().map(|embedding| embedding.values));
        self.chunks.extend(chunks);
        Ok(())
    }

    /// The `k` closest chunks, closest first. Ties keep insertion order.
    pub fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        self.check_dimension(query)?;

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(i, vector)| (i, self.distance.score(query, vector)))
            .collect();
        scored.sort_by(|a, b| self.distance.closest_first(a.1, b.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                score,
            })
            .collect())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "Vector dimension mismatch: index has {}, got {}",
                self.dimension,
                vector.len()
            );
        }
        Ok(())
    }

    /// Whether an index directory is present
    pub fn exists<P: AsRef<Path>>(dir: P) -> bool {
        dir.as_ref().exists()
    }

    /// Write the index into `dir`, creating it if needed
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory {}", dir.display()))?;

        let vectors = StoredVectors {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let encoded = bincode::serialize(&vectors).context("Failed to encode vectors")?;
        fs::write(dir.join(VECTORS_FILE), encoded)
            .with_context(|| format!("Failed to write {}", VECTORS_FILE))?;

        let manifest = IndexManifest {
            version: INDEX_FORMAT_VERSION,
            model: self.model.clone(),
            distance: self.distance,
            dimension: self.dimension,
            chunks: self.chunks.clone(),
        };
        let manifest = serde_json::to_string_pretty(&manifest)?;
        fs::write(dir.join(MANIFEST_FILE), manifest)
            .with_context(|| format!("Failed to write {}", MANIFEST_FILE))?;

        debug!("Saved {} vectors to {}", self.len(), dir.display());
        Ok(())
    }

    /// Read an index previously written by [`FlatIndex::save`]
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let manifest = fs::read_to_string(dir.join(MANIFEST_FILE))
            .with_context(|| format!("Failed to read {}", MANIFEST_FILE))?;
        let manifest: IndexManifest =
            serde_json::from_str(&manifest).context("Index manifest is corrupted")?;
        if manifest.version != INDEX_FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported index format version {} (expected {})",
                manifest.version,
                INDEX_FORMAT_VERSION
            );
        }

        let encoded = fs::read(dir.join(VECTORS_FILE))
            .with_context(|| format!("Failed to read {}", VECTORS_FILE))?;
        let stored: StoredVectors =
            bincode::deserialize(&encoded).context("Index vectors are corrupted")?;

        if stored.vectors.len() != manifest.chunks.len() {
            anyhow::bail!(
                "Index has {} vectors but {} chunks",
                stored.vectors.len(),
                manifest.chunks.len()
            );
        }
        if stored.dimension != manifest.dimension
            || stored.vectors.iter().any(|v| v.len() != stored.dimension)
        {
            anyhow::bail!("Index vectors do not match dimension {}", manifest.dimension);
        }

        info!(
            "Loaded {} vectors (model {}) from {}",
            manifest.chunks.len(),
            manifest.model,
            dir.display()
        );

        Ok(FlatIndex {
            model: manifest.model,
            distance: manifest.distance,
            dimension: stored.dimension,
            vectors: stored.vectors,
            chunks: manifest.chunks,
        })
    }
}

#[async_trait]
impl VectorStore for FlatIndex {
    async fn search(&self, query: &Embedding, k: usize) -> Result<Vec<ScoredChunk>> {
        self.search_vector(&query.values, k)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.len())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
