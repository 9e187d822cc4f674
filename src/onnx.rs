//! In-process sentence embeddings with ONNX Runtime.
//!
//! Runs the `all-MiniLM-L6-v2` sentence transformer: BERT tokenization,
//! mean pooling over the token embeddings weighted by the attention mask,
//! then L2 normalisation, giving 384-dimensional vectors.

use crate::embeddings::{Embedder, Embedding, DEFAULT_EMBEDDING_MODEL};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use ndarray::{Array2, ArrayView2, Axis, Ix3};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::{Tokenizer, TruncationParams};
use tokio::sync::OnceCell;

/// Hugging Face repository the model files are fetched from
pub const MODEL_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_MODEL_DIR: &str = "./models/all-MiniLM-L6-v2-onnx";
const MODEL_FILE: &str = "model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

const DIMENSION: usize = 384;
const MAX_LENGTH: usize = 256;
const BATCH_SIZE: usize = 32;

/// Where the model and tokenizer files are looked up
#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub model_dir: PathBuf,
}

impl OnnxConfig {
    pub fn new(model_dir: Option<String>) -> Self {
        OnnxConfig {
            model_dir: model_dir.unwrap_or_else(|| DEFAULT_MODEL_DIR.to_string()).into(),
        }
    }
}

/// `Embedder` backed by a local ONNX session, loaded on first use
pub struct OnnxEmbedder {
    config: OnnxConfig,
    model: OnceCell<Arc<OnnxModel>>,
}

impl OnnxEmbedder {
    pub fn new(config: OnnxConfig) -> Self {
        OnnxEmbedder {
            config,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<OnnxModel>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let dir = self.config.model_dir.clone();
                tokio::task::spawn_blocking(move || {
                    let (model_path, tokenizer_path) = resolve_model_files(&dir)?;
                    OnnxModel::load(&model_path, &tokenizer_path).map(Arc::new)
                })
                .await
                .context("Embedding model loader panicked")?
            })
            .await?;
        Ok(model.clone())
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Embedding>> {
        let model = self.model().await?;
        tokio::task::spawn_blocking(move || model.embed(&texts))
            .await
            .context("Embedding task panicked")?
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn model_name(&self) -> &str {
        DEFAULT_EMBEDDING_MODEL
    }

    async fn embed_query(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(vec![text.to_string()])
            .await?
            .pop()
            .context("Embedding model returned no vector")
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(BATCH_SIZE) {
            embeddings.extend(self.embed_batch(batch.to_vec()).await?);
        }
        Ok(embeddings)
    }
}

/// Use files already in `dir`, otherwise download them into the Hugging Face cache
fn resolve_model_files(dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let model_path = dir.join(MODEL_FILE);
    let tokenizer_path = dir.join(TOKENIZER_FILE);
    if model_path.exists() && tokenizer_path.exists() {
        return Ok((model_path, tokenizer_path));
    }

    info!(
        "Model files not found in {}, downloading {}",
        dir.display(),
        MODEL_REPO
    );
    let api = hf_hub::api::sync::Api::new().context("Failed to create Hugging Face client")?;
    let repo = api.model(MODEL_REPO.to_string());
    let model_path = repo
        .get("onnx/model.onnx")
        .with_context(|| format!("Failed to download ONNX model from {}", MODEL_REPO))?;
    let tokenizer_path = repo
        .get(TOKENIZER_FILE)
        .with_context(|| format!("Failed to download tokenizer from {}", MODEL_REPO))?;
    Ok((model_path, tokenizer_path))
}

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl OnnxModel {
    fn load(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .context("Failed to create session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?
            .with_intra_threads(4)
            .context("Failed to set intra threads")?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model from {}", model_path.display()))?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: MAX_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Failed to configure truncation: {}", e))?;
        tokenizer.with_padding(None);

        info!("Loaded embedding model from {}", model_path.display());
        Ok(OnnxModel {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = texts
            .iter()
            .map(|text| {
                self.tokenizer
                    .encode(text.as_str(), true)
                    .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|enc| enc.get_ids().len())
            .max()
            .unwrap_or(0);

        // Pad every sequence to the longest one in the batch
        let mut input_ids = Array2::<i64>::zeros((texts.len(), max_len));
        let mut attention_mask = Array2::<i64>::zeros((texts.len(), max_len));
        for (row, encoding) in encodings.iter().enumerate() {
            for (col, (&id, &mask)) in encoding
                .get_ids()
                .iter()
                .zip(encoding.get_attention_mask())
                .enumerate()
            {
                input_ids[[row, col]] = id as i64;
                attention_mask[[row, col]] = mask as i64;
            }
        }
        let token_type_ids = Array2::<i64>::zeros((texts.len(), max_len));

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("Embedding session lock poisoned"))?;
        let outputs = session.run(ort::inputs![
            "input_ids" => Value::from_array(input_ids)?,
            "attention_mask" => Value::from_array(attention_mask.clone())?,
            "token_type_ids" => Value::from_array(token_type_ids)?
        ])?;

        // Token embeddings: [batch, seq_len, hidden]
        let hidden = outputs[0]
            .try_extract_array::<f32>()
            .context("Failed to extract output tensor")?
            .into_dimensionality::<Ix3>()
            .context("Model output is not [batch, seq_len, hidden]")?;
        if hidden.shape()[2] != DIMENSION {
            anyhow::bail!(
                "Unexpected embedding dimension: {} (expected {})",
                hidden.shape()[2],
                DIMENSION
            );
        }

        let embeddings = hidden
            .axis_iter(Axis(0))
            .zip(attention_mask.axis_iter(Axis(0)))
            .map(|(tokens, mask)| {
                let mask: Vec<i64> = mask.to_vec();
                let mut values = mean_pool(tokens, &mask);
                l2_normalize(&mut values);
                Embedding { values }
            })
            .collect();
        Ok(embeddings)
    }
}

/// Average token vectors, ignoring padding positions
fn mean_pool(tokens: ArrayView2<f32>, mask: &[i64]) -> Vec<f32> {
    let mut pooled = vec![0.0f32; tokens.ncols()];
    let mut count = 0.0f32;

    for (row, &m) in tokens.axis_iter(Axis(0)).zip(mask) {
        if m == 0 {
            continue;
        }
        count += 1.0;
        for (acc, value) in pooled.iter_mut().zip(row.iter()) {
            *acc += value;
        }
    }

    for value in &mut pooled {
        *value /= count.max(1e-9);
    }
    pooled
}

fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in values.iter_mut() {
            *value /= norm;
        }
    }
}
