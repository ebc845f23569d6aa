//! HTTP handlers: thin glue between the engine, the history store and disk.

use std::path::PathBuf;
use std::sync::Arc;

use atelier_core::{Engine, EngineError, EngineSnapshot, GenerateParams};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use crate::history::{HistoryStore, NewRecord};
use crate::types::{GenerateRequest, GenerateResponse, HistoryEntry, HistoryQuery};

/// Shared server state. The engine mutex serializes generations and LoRA
/// reloads; the pipeline is not reentrant.
pub struct AppState {
    pub engine: Mutex<Engine>,
    pub history: HistoryStore,
    pub output_dir: PathBuf,
    pub web_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match e {
            EngineError::NotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

fn store_error(e: anyhow::Error) -> ApiError {
    error!(error = format!("{e:#}"), "history store failure");
    ApiError::internal("history store failure")
}

pub async fn generate(
    State(state): State<SharedState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let mut engine = state.engine.lock().await;
    if !engine.is_loaded() {
        return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "model not loaded"));
    }

    // LoRA transitions out of the applied state force a full reload, so
    // only reconcile when the request actually differs. A different scale
    // counts as a difference; merged weights cannot be rescaled in place.
    let lora_differs = req.lora_enabled != engine.lora_applied()
        || (req.lora_enabled && engine.lora_scale() != Some(req.lora_scale));
    if lora_differs {
        engine.set_lora(req.lora_enabled, req.lora_scale)?;
    }

    let params = GenerateParams {
        prompt: req.prompt.clone(),
        negative_prompt: req.negative_prompt.clone(),
        steps: req.steps,
        guidance: req.cfg,
        width: req.width,
        height: req.height,
        seed: req.seed,
        seed_mode: req.seed_mode,
    };
    let outcome = engine.generate(&params)?;
    let device = engine
        .snapshot()
        .device
        .map(|d| d.to_string())
        .unwrap_or_default();
    drop(engine);

    let filename = format!("{}.png", Uuid::new_v4().simple());
    let path = state.output_dir.join(&filename);
    outcome.image.save(&path).map_err(|e| {
        error!(error = %e, path = %path.display(), "failed to save image");
        ApiError::internal("failed to save image")
    })?;

    let record = NewRecord {
        filename: filename.clone(),
        prompt: req.prompt,
        negative_prompt: req.negative_prompt,
        steps: req.steps as i64,
        cfg: req.cfg,
        seed: i64::from(outcome.seed),
        width: req.width as i64,
        height: req.height as i64,
        lora_enabled: req.lora_enabled,
        lora_scale: req.lora_scale,
        device,
        duration: outcome.duration_secs,
    };
    let id = state.history.add(&record).await.map_err(store_error)?;
    let meta = state
        .history
        .get(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| ApiError::internal("record missing after insert"))?;

    info!(id, seed = outcome.seed, duration = outcome.duration_secs, %filename, "generation stored");
    Ok(Json(GenerateResponse {
        id,
        url: format!("/outputs/{filename}"),
        seed: outcome.seed,
        duration: outcome.duration_secs,
        meta,
    }))
}

pub async fn status(State(state): State<SharedState>) -> Json<EngineSnapshot> {
    let engine = state.engine.lock().await;
    Json(engine.snapshot())
}

pub async fn history_list(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let records = state
        .history
        .list(query.limit, query.offset)
        .await
        .map_err(store_error)?;
    let entries = records
        .into_iter()
        .map(|record| {
            let url = format!("/outputs/{}", record.filename);
            HistoryEntry { record, url }
        })
        .collect();
    Ok(Json(entries))
}

pub async fn history_delete(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.history.delete(id).await.map_err(store_error)? {
        Ok(Json(json!({ "status": "deleted" })))
    } else {
        Err(ApiError::not_found("record not found"))
    }
}

pub async fn serve_output(
    State(state): State<SharedState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !safe_name(&filename) {
        return Err(ApiError::not_found("no such image"));
    }
    let bytes = tokio::fs::read(state.output_dir.join(&filename))
        .await
        .map_err(|_| ApiError::not_found("no such image"))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

/// Static front end; `/` resolves to `index.html`.
pub async fn serve_web(State(state): State<SharedState>, uri: Uri) -> Result<Response, ApiError> {
    let rel = uri.path().trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };
    if rel
        .split('/')
        .any(|segment| segment.is_empty() || segment.starts_with('.'))
    {
        return Err(ApiError::not_found("not found"));
    }
    let bytes = tokio::fs::read(state.web_dir.join(rel))
        .await
        .map_err(|_| ApiError::not_found("not found"))?;
    Ok(([(header::CONTENT_TYPE, content_type(rel))], bytes).into_response())
}

fn safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.')
}

fn content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}
