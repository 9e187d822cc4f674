use crate::chat::ChatConfig;
use crate::database::QdrantConfig;
use crate::embeddings::OpenAiEmbeddingsConfig;
use crate::gemini::GeminiConfig;
use crate::onnx::OnnxConfig;
use anyhow::Result;
use log::warn;
use std::env;
use std::path::PathBuf;

const DEFAULT_PDF_PATH: &str = "./app/data/bhagavad_gita.pdf";
const DEFAULT_VECTOR_DB_PATH: &str = "vector_index";

/// Number of chunks handed to the model for each question
pub const TOP_K: usize = 5;

/// Which embedding backend to use
#[derive(Debug, Clone)]
pub enum EmbeddingBackend {
    /// `all-MiniLM-L6-v2` run in-process
    Onnx(OnnxConfig),
    OpenAi(OpenAiEmbeddingsConfig),
    Gemini(GeminiConfig),
}

/// Where chunks and their vectors live
#[derive(Debug, Clone)]
pub enum VectorBackend {
    /// Exact in-process index persisted under a directory
    Local { path: PathBuf },
    /// Remote Qdrant collection
    Qdrant(QdrantConfig),
}

/// Application configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub pdf_path: PathBuf,
    pub vector_backend: VectorBackend,
    pub embedding_backend: EmbeddingBackend,
    pub chat: ChatConfig,
    pub top_k: usize,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pdf_path = var("PDF_PATH").unwrap_or_else(|| DEFAULT_PDF_PATH.to_string());

        let vector_backend = match var("QDRANT_URL") {
            Some(url) => VectorBackend::Qdrant(QdrantConfig {
                url,
                api_key: var("QDRANT_API_KEY"),
            }),
            None => VectorBackend::Local {
                path: var("VECTOR_DB_PATH")
                    .unwrap_or_else(|| DEFAULT_VECTOR_DB_PATH.to_string())
                    .into(),
            },
        };

        let embedding_backend = match (var("GEMINI_API_KEY"), var("EMBEDDINGS_BASE_URL")) {
            (Some(api_key), _) => EmbeddingBackend::Gemini(GeminiConfig::new(
                api_key,
                var("GEMINI_EMBEDDINGS_URL"),
            )),
            (None, Some(base_url)) => EmbeddingBackend::OpenAi(OpenAiEmbeddingsConfig::new(
                Some(base_url),
                var("EMBEDDINGS_API_KEY"),
            )),
            (None, None) => EmbeddingBackend::Onnx(OnnxConfig::new(var("ONNX_MODEL_DIR"))),
        };

        let api_key = var("OPENROUTER_API_KEY");
        if api_key.is_none() {
            warn!("OPENROUTER_API_KEY is not set.");
        }

        Ok(Config {
            pdf_path: pdf_path.into(),
            vector_backend,
            embedding_backend,
            chat: ChatConfig::new(api_key),
            top_k: TOP_K,
        })
    }
}
