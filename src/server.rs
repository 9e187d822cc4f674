use crate::rag::SharedPipeline;
use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Clone)]
struct AppState {
    pipeline: SharedPipeline,
}

/// Body of `POST /chat`
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    ready: bool,
}

/// Routes of the service with permissive CORS
pub fn router(pipeline: SharedPipeline) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState { pipeline })
}

/// Initialise the pipeline, then serve until the process is stopped.
/// A failed initialisation is logged and retried by the first chat request.
pub async fn serve(pipeline: SharedPipeline, addr: SocketAddr) -> Result<()> {
    if let Err(e) = pipeline.get().await {
        error!("Error initializing RAG pipeline: {:#}", e);
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, router(pipeline)).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        ready: state.pipeline.is_ready(),
    })
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    let message = request.message;
    if message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, TEXT_PLAIN)],
            "Error: message is required",
        )
            .into_response();
    }

    let pipeline = state.pipeline;
    let body = async_stream::stream! {
        let tokens = match pipeline.get().await {
            Ok(rag) => rag.answer_stream(&message).await,
            Err(e) => Err(e),
        };

        match tokens {
            Ok(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(token) => yield Ok::<String, Infallible>(token),
                        Err(e) => {
                            error!("Streaming error: {:#}", e);
                            yield Ok(format!("Error: {:#}", e));
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Chat request failed: {:#}", e);
                yield Ok(format!("Error: {:#}", e));
            }
        }
    };

    ([(header::CONTENT_TYPE, TEXT_PLAIN)], Body::from_stream(body)).into_response()
}
