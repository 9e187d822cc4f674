use crate::chat::{ChatModel, OpenRouterClient, TokenStream};
use crate::chunking::{TextChunk, TextSplitter};
use crate::config::{Config, EmbeddingBackend, VectorBackend};
use crate::database::{QdrantClient, QdrantCollection, ScoredChunk, VectorStore};
use crate::document::Document;
use crate::embeddings::{Embedder, OpenAiEmbedder};
use crate::gemini::GeminiClient;
use crate::index::{Distance, FlatIndex};
use crate::onnx::OnnxEmbedder;
use crate::prompt;
use anyhow::{Context, Result};
use futures::StreamExt;
use log::{info, warn};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagPipeline {
    store: Box<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
}

impl RagPipeline {
    pub fn new(
        store: Box<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        RagPipeline {
            store,
            embedder,
            chat,
            top_k,
        }
    }

    /// Wire up the configured clients and open (or build) the vector store
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::with_embedder(config, embedder_from_config(config)).await
    }

    /// Like `from_config`, with the embedding model supplied by the caller
    pub async fn with_embedder(config: &Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        info!("Initializing RAG pipeline...");
        let store = open_vector_store(config, embedder.as_ref(), false).await?;
        let chat: Arc<dyn ChatModel> = Arc::new(OpenRouterClient::new(config.chat.clone()));
        info!("RAG pipeline initialized.");

        Ok(RagPipeline::new(store, embedder, chat, config.top_k))
    }

    /// Embed the question and return the closest chunks
    pub async fn retrieve(&self, question: &str) -> Result<Vec<ScoredChunk>> {
        let question_embedding = self
            .embedder
            .embed_query(question)
            .await
            .context("Failed to embed question")?;

        self.store.search(&question_embedding, self.top_k).await
    }

    /// Retrieve context for the question and stream the model's answer
    pub async fn answer_stream(&self, question: &str) -> Result<TokenStream> {
        let chunks = self.retrieve(question).await?;
        if chunks.is_empty() {
            warn!("No relevant chunks found for question");
        }

        self.chat
            .stream_chat(prompt::messages(&chunks, question))
            .await
    }

    /// Ask questions from stdin until `exit`, printing answers as they stream
    pub async fn run_query_loop(&self) -> Result<()> {
        info!("Ready to answer questions. Type 'exit' to quit.");

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let mut buffer = String::new();

        loop {
            print!("\nYour question: ");
            stdout.flush()?;

            buffer.clear();
            if stdin.lock().read_line(&mut buffer)? == 0 {
                break;
            }

            let question = buffer.trim();
            if question.is_empty() {
                continue;
            }
            if question.eq_ignore_ascii_case("exit") {
                info!("Goodbye!");
                break;
            }

            let mut tokens = self.answer_stream(question).await?;
            println!();
            while let Some(token) = tokens.next().await {
                print!("{}", token?);
                stdout.flush()?;
            }
            println!();
        }

        Ok(())
    }
}

/// Pick the embedding client the configuration asks for
pub fn embedder_from_config(config: &Config) -> Arc<dyn Embedder> {
    match &config.embedding_backend {
        EmbeddingBackend::Onnx(cfg) => Arc::new(OnnxEmbedder::new(cfg.clone())),
        EmbeddingBackend::OpenAi(cfg) => Arc::new(OpenAiEmbedder::new(cfg.clone())),
        EmbeddingBackend::Gemini(cfg) => Arc::new(GeminiClient::new(cfg.clone())),
    }
}

/// Load the existing vector store, or build it from the document.
/// With `rebuild` the existing store is ignored and replaced.
pub async fn open_vector_store(
    config: &Config,
    embedder: &dyn Embedder,
    rebuild: bool,
) -> Result<Box<dyn VectorStore>> {
    match &config.vector_backend {
        VectorBackend::Local { path } => {
            let index = open_local_index(&config.pdf_path, path, embedder, rebuild).await?;
            Ok(Box::new(index))
        }
        VectorBackend::Qdrant(qdrant_config) => {
            let client = QdrantClient::new(qdrant_config.clone())
                .context("Failed to initialize Qdrant client")?;
            let collection =
                open_qdrant_collection(&config.pdf_path, client, embedder, rebuild).await?;
            Ok(Box::new(collection))
        }
    }
}

/// The local index at `index_path`, built from `pdf_path` when absent or unreadable
pub async fn open_local_index(
    pdf_path: &Path,
    index_path: &Path,
    embedder: &dyn Embedder,
    rebuild: bool,
) -> Result<FlatIndex> {
    if !rebuild && FlatIndex::exists(index_path) {
        info!("Loading existing index from {}...", index_path.display());
        match FlatIndex::load(index_path) {
            Ok(index) if index.model() == embedder.model_name() => return Ok(index),
            Ok(index) => warn!(
                "Index was built with {} but the embedder is {}. Recreating...",
                index.model(),
                embedder.model_name()
            ),
            Err(e) => warn!("Failed to load index: {:#}. Recreating...", e),
        }
    }

    info!("Creating new index...");
    let (chunks, embeddings) = embed_document(pdf_path, embedder).await?;

    let mut index = FlatIndex::new(embedder.model_name(), Distance::L2);
    index.add(chunks, embeddings)?;
    index.save(index_path)?;
    info!("Index saved to {}", index_path.display());

    Ok(index)
}

async fn open_qdrant_collection(
    pdf_path: &Path,
    client: QdrantClient,
    embedder: &dyn Embedder,
    rebuild: bool,
) -> Result<QdrantCollection> {
    let document_id = pdf_path
        .file_name()
        .and_then(|name| name.to_str())
        .context("Invalid file name")?
        .to_string();

    if client.collection_exists(&document_id).await? {
        if !rebuild && client.count(&document_id).await? > 0 {
            info!("Using existing collection for {}", document_id);
            return Ok(QdrantCollection::new(client, document_id));
        }
        client.delete_collection(&document_id).await?;
    }

    let (chunks, embeddings) = embed_document(pdf_path, embedder).await?;
    let vector_size = embeddings
        .first()
        .map(|e| e.dimension() as u64)
        .context("Embedder returned no vectors")?;

    client.create_collection(&document_id, vector_size).await?;
    client.store_chunks(chunks, embeddings, &document_id).await?;

    Ok(QdrantCollection::new(client, document_id))
}

/// Load, chunk and embed the source document
async fn embed_document(
    pdf_path: &Path,
    embedder: &dyn Embedder,
) -> Result<(Vec<TextChunk>, Vec<crate::embeddings::Embedding>)> {
    let document = Document::from_file(pdf_path)?;
    info!(
        "Loaded {} ({} pages, {} characters)",
        document.document_id,
        document.pages.len(),
        document.char_count()
    );

    let chunks = TextSplitter::default().split_document(&document);
    if chunks.is_empty() {
        anyhow::bail!("No text chunks generated from PDF.");
    }
    info!("Split into {} chunks", chunks.len());

    info!("Generating embeddings with {}...", embedder.model_name());
    let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
    let embeddings = embedder
        .embed_documents(&texts)
        .await
        .context("Failed to embed chunks")?;

    Ok((chunks, embeddings))
}

/// Process-wide pipeline, built on first use.
///
/// Concurrent callers wait on a single initialisation; a failed
/// initialisation is not remembered, so the next caller tries again.
#[derive(Clone)]
pub struct SharedPipeline {
    config: Option<Arc<Config>>,
    embedder: Option<Arc<dyn Embedder>>,
    cell: Arc<OnceCell<Arc<RagPipeline>>>,
}

impl SharedPipeline {
    pub fn new(config: Config) -> Self {
        SharedPipeline {
            config: Some(Arc::new(config)),
            embedder: None,
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Build from `config`, embedding with `embedder` instead of the configured backend
    pub fn with_embedder(config: Config, embedder: Arc<dyn Embedder>) -> Self {
        SharedPipeline {
            embedder: Some(embedder),
            ..Self::new(config)
        }
    }

    /// Wrap an already built pipeline
    pub fn ready(pipeline: RagPipeline) -> Self {
        SharedPipeline {
            config: None,
            embedder: None,
            cell: Arc::new(OnceCell::new_with(Some(Arc::new(pipeline)))),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<RagPipeline>> {
        let pipeline = self
            .cell
            .get_or_try_init(|| async {
                let config = self
                    .config
                    .as_deref()
                    .context("Pipeline has no configuration to initialize from")?;
                let embedder = self
                    .embedder
                    .clone()
                    .unwrap_or_else(|| embedder_from_config(config));
                RagPipeline::with_embedder(config, embedder)
                    .await
                    .map(Arc::new)
            })
            .await?;

        Ok(Arc::clone(pipeline))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::chat::ChatMessage;
    use crate::embeddings::Embedding;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Counts a few keywords so related texts land close together
    pub struct KeywordEmbedder {
        pub calls: AtomicUsize,
    }

    pub const KEYWORDS: [&str; 4] = ["duty", "soul", "devotion", "knowledge"];

    impl KeywordEmbedder {
        pub fn new() -> Self {
            KeywordEmbedder {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keyword-test"
        }

        async fn embed_query(&self, text: &str) -> Result<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let lower = text.to_lowercase();
            Ok(Embedding {
                values: KEYWORDS
                    .iter()
                    .map(|k| lower.matches(k).count() as f32)
                    .collect(),
            })
        }
    }

    /// Replies with fixed tokens and remembers the prompt it was sent
    pub struct ScriptedChat {
        pub tokens: Vec<&'static str>,
        pub seen: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedChat {
        pub fn new(tokens: Vec<&'static str>) -> Self {
            ScriptedChat {
                tokens,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
            self.seen.lock().unwrap().extend(messages);
            let tokens: Vec<Result<String>> =
                self.tokens.iter().map(|t| Ok(t.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(tokens)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{KeywordEmbedder, ScriptedChat};
    use super::*;
    use crate::embeddings::Embedding;
    use std::sync::atomic::Ordering;

    const SCRIPTURE: &str = "The Bhagavad Gita\n\
        Chapter 2\n\
        Verse 47 You have a right to perform your duty, but not to the fruits of action.\n\
        Chapter 2\n\
        Verse 20 The soul is never born and never dies.\n\
        Chapter 12\n\
        Verse 8 Fix your mind on me alone with devotion.";

    fn write_source(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("gita.txt");
        std::fs::write(&path, SCRIPTURE).unwrap();
        path
    }

    #[tokio::test]
    async fn test_builds_then_reuses_local_index() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let index_path = dir.path().join("vector_index");
        let embedder = KeywordEmbedder::new();

        let built = open_local_index(&source, &index_path, &embedder, false)
            .await
            .unwrap();
        assert!(!built.is_empty());
        assert!(index_path.exists());
        let calls_after_build = embedder.calls.load(Ordering::SeqCst);
        assert_eq!(calls_after_build, built.len());

        // Source gone: the saved index must be used as-is
        std::fs::remove_file(&source).unwrap();
        let loaded = open_local_index(&source, &index_path, &embedder, false)
            .await
            .unwrap();
        assert_eq!(loaded.len(), built.len());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_after_build);
    }

    #[tokio::test]
    async fn test_corrupted_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let index_path = dir.path().join("vector_index");
        std::fs::create_dir_all(&index_path).unwrap();
        std::fs::write(index_path.join("index.json"), "not json").unwrap();

        let index = open_local_index(&source, &index_path, &KeywordEmbedder::new(), false)
            .await
            .unwrap();
        assert!(!index.is_empty());
        assert!(FlatIndex::load(&index_path).is_ok());
    }

    #[tokio::test]
    async fn test_index_from_other_model_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let index_path = dir.path().join("vector_index");

        let mut stale = FlatIndex::new("other-model", Distance::L2);
        stale
            .add(
                vec![TextChunk {
                    text: "stale".to_string(),
                    document_id: "gita.txt".to_string(),
                    page: 0,
                    chunk_index: 0,
                    start_position: 0,
                }],
                vec![Embedding {
                    values: vec![0.0, 0.0, 0.0, 1.0],
                }],
            )
            .unwrap();
        stale.save(&index_path).unwrap();

        let embedder = KeywordEmbedder::new();
        let index = open_local_index(&source, &index_path, &embedder, false)
            .await
            .unwrap();

        assert!(embedder.calls.load(Ordering::SeqCst) > 0);
        assert_eq!(index.model(), "keyword-test");
        assert_eq!(FlatIndex::load(&index_path).unwrap().model(), "keyword-test");
    }

    #[tokio::test]
    async fn test_rebuild_replaces_valid_index() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let index_path = dir.path().join("vector_index");
        let embedder = KeywordEmbedder::new();

        let built = open_local_index(&source, &index_path, &embedder, false)
            .await
            .unwrap();
        let calls_after_build = embedder.calls.load(Ordering::SeqCst);

        let rebuilt = open_local_index(&source, &index_path, &embedder, true)
            .await
            .unwrap();
        assert_eq!(
            embedder.calls.load(Ordering::SeqCst),
            calls_after_build + built.len()
        );
        assert_eq!(rebuilt.len(), built.len());
    }

    #[tokio::test]
    async fn test_empty_document_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.txt");
        std::fs::write(&source, "   \n\n ").unwrap();

        let err = open_local_index(
            &source,
            &dir.path().join("vector_index"),
            &KeywordEmbedder::new(),
            false,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "No text chunks generated from PDF.");
        assert!(!dir.path().join("vector_index").exists());
    }

    #[tokio::test]
    async fn test_answer_stream_grounds_prompt_in_retrieved_text() {
        let mut index = FlatIndex::new("keyword-test", Distance::L2);
        let embedder = Arc::new(KeywordEmbedder::new());
        let chunks: Vec<TextChunk> = ["perform your duty", "the soul is eternal"]
            .iter()
            .enumerate()
            .map(|(i, text)| TextChunk {
                text: text.to_string(),
                document_id: "gita.txt".to_string(),
                page: 0,
                chunk_index: i,
                start_position: 0,
            })
            .collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder.embed_documents(&texts).await.unwrap();
        index.add(chunks, embeddings).unwrap();

        let chat = Arc::new(ScriptedChat::new(vec!["In Chapter 2, ", "Verse 47..."]));
        let pipeline = RagPipeline::new(Box::new(index), embedder, chat.clone(), 1);

        let retrieved = pipeline.retrieve("What is my duty?").await.unwrap();
        assert_eq!(retrieved.len(), 1);
        assert_eq!(retrieved[0].chunk.text, "perform your duty");

        let answer: Vec<String> = pipeline
            .answer_stream("What is my duty?")
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(answer.concat(), "In Chapter 2, Verse 47...");

        let seen = chat.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].content.contains("perform your duty"));
        assert!(!seen[0].content.contains("the soul is eternal"));
        assert!(seen[0].content.contains("Question: What is my duty?"));
    }

    #[tokio::test]
    async fn test_shared_pipeline_retries_failed_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_vars(|_| None).unwrap();
        config.pdf_path = dir.path().join("missing.pdf");
        config.vector_backend = VectorBackend::Local {
            path: dir.path().join("vector_index"),
        };

        let shared = SharedPipeline::new(config);
        let err = shared.get().await.err().unwrap();
        assert!(format!("{:#}", err).contains("PDF file not found"));
        assert!(!shared.is_ready());

        // still failing, and still not cached
        assert!(shared.get().await.is_err());
        assert!(!shared.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_vars(|_| None).unwrap();
        config.pdf_path = write_source(dir.path());
        config.vector_backend = VectorBackend::Local {
            path: dir.path().join("vector_index"),
        };
        let chunk_count = TextSplitter::default().split_text(SCRIPTURE).len();

        let embedder = Arc::new(KeywordEmbedder::new());
        let shared = SharedPipeline::with_embedder(config, embedder.clone());
        let (first, second) = tokio::join!(shared.get(), shared.get());

        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(shared.is_ready());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), chunk_count);
    }
}
