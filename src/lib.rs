pub mod chat;
pub mod chunking;
pub mod config;
pub mod database;
pub mod document;
pub mod embeddings;
pub mod gemini;
pub mod index;
pub mod onnx;
pub mod prompt;
pub mod rag;
pub mod server;
