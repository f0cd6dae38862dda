use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use redecor_contracts::artifacts::GenerationResponse;
use redecor_contracts::config::ServerConfig;
use redecor_contracts::errors::{ErrorKind, PipelineError};
use redecor_engine::{GenerationPipeline, UploadRequest};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<GenerationPipeline>,
}

/// JSON error body: `{"detail": ..., "kind": ...}` plus request ids when known.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
    kind: Option<ErrorKind>,
    request_id: Option<String>,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
            kind: Some(ErrorKind::InvalidInput),
            request_id: None,
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
            kind: None,
            request_id: None,
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self {
            status: StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            detail: err.to_string(),
            kind: Some(err.kind),
            request_id: Some(err.request_id),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "detail": self.detail,
            "kind": self.kind,
            "request_id": self.request_id,
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(pipeline: Arc<GenerationPipeline>, config: &ServerConfig) -> anyhow::Result<Router> {
    let cors = cors_layer(&config.cors_allowed_origins)?;
    let uploads = pipeline.store().uploads_namespace().to_string();
    let generated = pipeline.store().generated_namespace().to_string();
    Ok(Router::new()
        .route("/", get(home))
        .route("/generate", post(generate))
        .route("/generate/", post(generate))
        .route(&format!("/{uploads}/:file"), get(upload_file))
        .route(&format!("/{generated}/:file"), get(generated_file))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(cors)
        .with_state(AppState { pipeline }))
}

/// Any method and header; origins from config, with `*` meaning any origin.
fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|origin| origin.trim() == "*") {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin.trim())
                .with_context(|| format!("invalid CORS origin '{origin}'"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

pub async fn serve(config: ServerConfig, pipeline: Arc<GenerationPipeline>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed binding {}", config.bind))?;
    info!(
        addr = %listener.local_addr()?,
        engine = pipeline.engine_name(),
        device = %pipeline.device(),
        "listening"
    );
    let app = router(pipeline, &config)?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed installing ctrl-c handler: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn home() -> Json<serde_json::Value> {
    Json(json!({ "message": "Room re-design API is running." }))
}

async fn generate(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<GenerationResponse>, ApiError> {
    let mut image_bytes = None;
    let mut prompt = None;
    let mut seed = None;
    let mut steps = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                image_bytes = Some(bytes.to_vec());
            }
            "prompt" | "seed" | "steps" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                match name.as_str() {
                    "prompt" => prompt = Some(text),
                    "seed" => seed = parse_optional::<u64>("seed", &text)?,
                    _ => steps = parse_optional::<u32>("steps", &text)?,
                }
            }
            _ => {}
        }
    }

    let (Some(image_bytes), Some(prompt)) = (image_bytes, prompt) else {
        return Err(ApiError::bad_request("Missing file or prompt"));
    };
    let upload = UploadRequest {
        image_bytes,
        prompt,
        seed,
        steps,
    };

    let pipeline = Arc::clone(&state.pipeline);
    let outcome = tokio::task::spawn_blocking(move || pipeline.run(upload))
        .await
        .map_err(|err| ApiError::internal(format!("generation task aborted: {err}")))??;
    let base_url = &state.pipeline.settings().public_base_url;
    Ok(Json(outcome.response(base_url)))
}

fn parse_optional<T: std::str::FromStr>(field: &str, text: &str) -> Result<Option<T>, ApiError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| ApiError::bad_request(format!("invalid {field} '{text}'")))
}

async fn upload_file(state: State<AppState>, Path(file): Path<String>) -> Response {
    let namespace = state.pipeline.store().uploads_namespace().to_string();
    read_artifact(state, namespace, file).await
}

async fn generated_file(state: State<AppState>, Path(file): Path<String>) -> Response {
    let namespace = state.pipeline.store().generated_namespace().to_string();
    read_artifact(state, namespace, file).await
}

async fn read_artifact(State(state): State<AppState>, namespace: String, file: String) -> Response {
    let pipeline = Arc::clone(&state.pipeline);
    let lookup =
        tokio::task::spawn_blocking(move || pipeline.store().read_public(&namespace, &file)).await;
    match lookup {
        Ok(Ok(Some((bytes, content_type)))) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Ok(Ok(None)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" }))).into_response()
        }
        Ok(Err(err)) => {
            warn!("failed reading artifact: {err:#}");
            ApiError::internal("failed reading artifact").into_response()
        }
        Err(err) => ApiError::internal(format!("artifact task aborted: {err}")).into_response(),
    }
}
