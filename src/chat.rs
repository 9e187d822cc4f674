use anyhow::{Context, Result};
use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub const LLM_MODEL: &str = "tngtech/deepseek-r1t2-chimera:free";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const TEMPERATURE: f32 = 0.3;

/// Answer text as it arrives from the model
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A language model that streams its reply
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<TokenStream>;
}

/// Configuration for the chat-completion API
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
}

impl ChatConfig {
    pub fn new(api_key: Option<String>) -> Self {
        ChatConfig {
            api_key,
            base_url: OPENROUTER_BASE_URL.to_string(),
            model: LLM_MODEL.to_string(),
            temperature: TEMPERATURE,
        }
    }
}

/// Client for an OpenAI-compatible `chat/completions` endpoint (OpenRouter)
#[derive(Clone)]
pub struct OpenRouterClient {
    config: ChatConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

impl OpenRouterClient {
    pub fn new(config: ChatConfig) -> Self {
        let client = reqwest::Client::new();
        OpenRouterClient { config, client }
    }
}

#[async_trait]
impl ChatModel for OpenRouterClient {
    async fn stream_chat(&self, messages: Vec<ChatMessage>) -> Result<TokenStream> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .context("OPENROUTER_API_KEY is not set")?;

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let request = CompletionRequest {
            model: &self.config.model,
            messages: &messages,
            temperature: self.config.temperature,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

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

        Ok(decode_sse(response.bytes_stream()))
    }
}

/// Turn a server-sent-events byte stream into content deltas
pub fn decode_sse<S, B, E>(bytes: S) -> TokenStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send + 'static,
{
    let stream = stream! {
        let mut events = Box::pin(bytes.eventsource());

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield Err(anyhow::anyhow!("Failed to read completion stream: {}", e));
                    break;
                }
            };

            match parse_event_data(&event.data) {
                Ok(Completion::Delta(text)) => yield Ok(text),
                Ok(Completion::Skip) => {}
                Ok(Completion::Done) => break,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    Box::pin(stream)
}

#[derive(Debug, PartialEq)]
enum Completion {
    Delta(String),
    Done,
    Skip,
}

#[derive(Deserialize, Debug)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Deserialize, Debug)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

/// Map the data of one event (its `data:` lines already joined) to a delta
fn parse_event_data(data: &str) -> Result<Completion> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Completion::Done);
    }
    if data.is_empty() {
        return Ok(Completion::Skip);
    }

    let chunk: CompletionChunk =
        serde_json::from_str(data).with_context(|| format!("Malformed completion chunk: {}", data))?;
    if let Some(error) = chunk.error {
        anyhow::bail!("Model returned an error: {}", error.message);
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty());
    if content.is_none() {
        debug!("Completion event without content: {}", data);
    }

    Ok(content.map(Completion::Delta).unwrap_or(Completion::Skip))
}
