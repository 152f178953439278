//! HTTP front-end.
//!
//! One endpoint does the work: `POST /ai/ai-response` takes `{question}`
//! and returns the structured answer payload. Invalid input gets a 400 with
//! `{error}`. A `/health` route reports liveness. CORS is wide open for the
//! campus front-end.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::search::QueryEngine;

#[derive(Clone)]
struct AppState {
    engine: Arc<QueryEngine>,
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(engine: Arc<QueryEngine>, bind: &str) -> anyhow::Result<()> {
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    println!("listening on http://{}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/ai/ai-response", post(handle_ai_response))
        .route("/health", get(handle_health))
        .with_state(state)
}

#[derive(Deserialize)]
struct AiRequest {
    question: Option<String>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct BadRequest(String);

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error: self.0 })).into_response()
    }
}

async fn handle_ai_response(
    State(state): State<AppState>,
    request: Result<Json<AiRequest>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => {
            return BadRequest(format!("invalid request body: {}", rejection)).into_response()
        }
    };

    let question = request.question.unwrap_or_default();
    let question = question.trim();
    if question.is_empty() {
        return BadRequest("question must not be empty".to_string()).into_response();
    }

    tracing::info!(question = %question, "ai-response request");
    let response = state.engine.answer(question).await;
    Json(response).into_response()
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
