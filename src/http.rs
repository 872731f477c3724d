//! HTTP transport module for the session server
//!
//! JSON API under `/api`, permissive CORS, and the static UI served as fallback.

use axum::{
    Json, Router,
    extract::{Path, Request, State, rejection::JsonRejection},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

use crate::error::{QnaError, Result};
use crate::events::EventSink;
use crate::query::{QueryLayer, StatusReport};
use crate::session::{AnswerSubmission, SessionManager};
use crate::store::{Answer, Question};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub queries: Arc<QueryLayer>,
    pub events: Arc<dyn EventSink>,
}

impl AppState {
    pub fn new(manager: SessionManager, queries: QueryLayer) -> Self {
        let events = manager.events().clone();
        Self {
            manager: Arc::new(manager),
            queries: Arc::new(queries),
            events,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateQuestionRequest {
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachOptionsRequest {
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| QnaError::validation(format!("Invalid request body: {}", e.body_text())))
}

/// Options must be a non-empty array of strings
fn parse_options(options: Option<Value>) -> Result<Vec<String>> {
    let invalid = || QnaError::validation("Answer options are required");
    let items = match options {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(invalid()),
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            _ => Err(invalid()),
        })
        .collect()
}

pub async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusReport>> {
    Ok(Json(state.queries.get_status().await?))
}

pub async fn context_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(Json(state.queries.get_context().await?))
}

pub async fn list_questions_handler(State(state): State<AppState>) -> Result<Json<Vec<Question>>> {
    Ok(Json(state.queries.list_questions().await?))
}

pub async fn get_question_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Question>> {
    state
        .queries
        .get_question(&id)
        .await?
        .map(Json)
        .ok_or_else(|| QnaError::not_found("Question not found"))
}

pub async fn create_question_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateQuestionRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let req = body(payload)?;
    let question_id = state
        .manager
        .create_question(req.question.as_deref())
        .await?;
    Ok(Json(json!({ "success": true, "question_id": question_id })))
}

pub async fn attach_options_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<AttachOptionsRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let options = parse_options(body(payload)?.options)?;
    let question = state.manager.attach_options(&id, options).await?;
    Ok(Json(json!({ "success": true, "question": question })))
}

pub async fn regenerate_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegenerateRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let req = body(payload)?;
    let question_id = state
        .manager
        .regenerate_question(req.question_id.as_deref(), req.reason.as_deref())
        .await?;
    Ok(Json(json!({ "success": true, "question_id": question_id })))
}

pub async fn list_answers_handler(State(state): State<AppState>) -> Result<Json<Vec<Answer>>> {
    Ok(Json(state.queries.list_answers().await?))
}

pub async fn submit_answer_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<AnswerSubmission>, JsonRejection>,
) -> Result<Json<Value>> {
    let submission = body(payload)?;
    state.manager.submit_answer(&submission).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn cancel_answer_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    let question_id = state.manager.cancel_last_answer().await?;
    Ok(Json(json!({ "success": true, "question_id": question_id })))
}

pub async fn backup_handler(State(state): State<AppState>) -> Result<Json<Value>> {
    let message = state.manager.create_backup().await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

/// Records `API <METHOD> <path>` with status and latency for every `/api` request
async fn record_api_call(
    State(events): State<Arc<dyn EventSink>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if !path.starts_with("/api/") {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let start = Instant::now();
    let resp = next.run(req).await;
    events.api_call(
        &method,
        &path,
        resp.status().as_u16(),
        start.elapsed().as_millis(),
    );
    resp
}

/// Build the router. `static_dir`, when given, is served for every non-API path.
pub fn router(state: AppState, static_dir: Option<PathBuf>) -> Router {
    let events = state.events.clone();

    let mut app = Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/context", get(context_handler))
        .route(
            "/api/questions",
            get(list_questions_handler).post(create_question_handler),
        )
        .route("/api/questions/regenerate", post(regenerate_handler))
        .route("/api/questions/:id", get(get_question_handler))
        .route("/api/questions/:id/options", post(attach_options_handler))
        .route(
            "/api/answers",
            get(list_answers_handler).post(submit_answer_handler),
        )
        .route("/api/answers/cancel", post(cancel_answer_handler))
        .route("/api/backup", post(backup_handler))
        .with_state(state);

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(middleware::from_fn_with_state(events, record_api_call))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Start the HTTP server and run until Ctrl-C
pub async fn start_http_server(bind: SocketAddr, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP listener: {}", e))?;

    tracing::info!("QNA session server listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    Ok(())
}
