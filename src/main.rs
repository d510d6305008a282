//! Carte grise scan - registration certificate OCR and vehicle form reconciliation server.

mod config;
mod flow;
mod normalizer;
mod recognition;
mod sessions;
mod text_patterns;
mod vehicle;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, patch, post},
    Router,
};
use config::{BackendKind, ScanConfig};
use flow::{FlowError, FormSession, ScanOutcome};
use normalizer::Normalizer;
use recognition::remote::RemoteScanService;
use recognition::session::SessionCookie;
use recognition::vision::VisionClient;
use recognition::{RecognitionService, ScanImage};
use sessions::{SessionRegistry, SharedSession};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use text_patterns::CompiledPatterns;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vehicle::{VehicleField, VehicleRecord};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    sessions: SessionRegistry,
    recognizer: Arc<dyn RecognitionService>,
    normalizer: Arc<Normalizer>,
    upstream_cookie: SessionCookie,
}

type HandlerError = (StatusCode, String);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "carte_grise_scan=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ScanConfig::load()?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let upstream_cookie = SessionCookie::new();
    let recognizer: Arc<dyn RecognitionService> = match config.backend {
        BackendKind::Vision => Arc::new(VisionClient::from_env(client, &config.model, &config.prompt)?),
        BackendKind::Remote => {
            let url = config
                .remote_url
                .clone()
                .context("SCAN_REMOTE_URL must be set for the remote backend")?;
            Arc::new(RemoteScanService::new(client, url, upstream_cookie.clone()))
        }
    };
    info!("Recognition backend: {}", recognizer.name());

    let patterns = CompiledPatterns::compile(&config.text_patterns);
    if patterns.is_empty() {
        warn!("No text patterns compiled, free-text fallback disabled");
    }

    let sessions = SessionRegistry::new(
        Duration::from_secs(config.session_ttl_secs),
        config.max_sessions,
    );
    sessions.spawn_reaper(Duration::from_secs((config.session_ttl_secs / 2).clamp(1, 60)));

    let state = AppState {
        sessions,
        recognizer,
        normalizer: Arc::new(Normalizer::new(patterns)),
        upstream_cookie,
    };

    let app = build_router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scan", post(scan_once))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(close_session))
        .route("/sessions/:id/vehicle", patch(edit_vehicle))
        .route("/sessions/:id/scan", post(scan_session))
        .route("/sessions/:id/preview", patch(edit_preview))
        .route("/sessions/:id/apply", post(apply_preview))
        .route("/sessions/:id/cancel", post(cancel_preview))
        .route("/sessions/:id/dismiss", post(dismiss_no_data))
        .route("/upstream-session", delete(clear_upstream_session))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Session snapshot with the form's fill progress.
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    #[serde(flatten)]
    session: FormSession,
    filled_fields: usize,
    total_fields: usize,
}

impl SessionView {
    fn of(session: &FormSession) -> Self {
        Self {
            filled_fields: session.vehicle.filled_count(),
            total_fields: VehicleField::ALL.len(),
            session: session.clone(),
        }
    }
}

/// One-shot scan without a form session.
async fn scan_once(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ScanOutcome>, HandlerError> {
    let image = read_image(multipart).await?;

    let raw = state.recognizer.recognize(&image).await.map_err(|e| {
        error!("Scan failed: {}", e);
        (StatusCode::BAD_GATEWAY, flow::failure_message(&e))
    })?;

    let vehicle = state.normalizer.normalize(&raw);
    let outcome = if vehicle.is_blank() {
        ScanOutcome::NoDataDetected {
            message: flow::NO_DATA_MESSAGE.to_string(),
        }
    } else {
        ScanOutcome::Preview { vehicle }
    };
    Ok(Json(outcome))
}

async fn create_session(State(state): State<AppState>) -> Result<Json<SessionView>, HandlerError> {
    let session = state.sessions.create().await.ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "Too many open form sessions".to_string(),
    ))?;
    let view = SessionView::of(&*session.lock().await);
    info!("Opened form session {} ({} open)", view.session.id, state.sessions.len().await);
    Ok(Json(view))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, HandlerError> {
    let session = find_session(&state, &id).await?;
    let guard = session.lock().await;
    Ok(Json(SessionView::of(&guard)))
}

/// Close a form session and hand back its final vehicle record.
async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<VehicleRecord>, HandlerError> {
    let session = state
        .sessions
        .remove(&id)
        .await
        .ok_or((StatusCode::NOT_FOUND, format!("Unknown session: {}", id)))?;
    let vehicle = session.lock().await.vehicle.clone();
    info!("Closed form session {}", id);
    Ok(Json(vehicle))
}

/// Direct user edits to the form record.
async fn edit_vehicle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(edits): Json<HashMap<String, String>>,
) -> Result<Json<SessionView>, HandlerError> {
    let edits = parse_edits(edits)?;
    let session = find_session(&state, &id).await?;
    let mut guard = session.lock().await;
    for (field, value) in edits {
        guard.edit_field(field, value);
    }
    Ok(Json(SessionView::of(&guard)))
}

/// Scan a certificate into the session's preview.
async fn scan_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<Json<ScanOutcome>, HandlerError> {
    let session = find_session(&state, &id).await?;
    let image = read_image(multipart).await?;

    // Detached so a dropped request cannot leave the session stuck in Scanning.
    let task = tokio::spawn(async move {
        flow::run_scan(&session, state.recognizer.as_ref(), &state.normalizer, &image).await
    });

    let outcome = task
        .await
        .map_err(|e| {
            error!("Scan task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Scan task failed: {}", e))
        })?
        .map_err(flow_error)?;
    Ok(Json(outcome))
}

async fn edit_preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(edits): Json<HashMap<String, String>>,
) -> Result<Json<SessionView>, HandlerError> {
    let edits = parse_edits(edits)?;
    let session = find_session(&state, &id).await?;
    let mut guard = session.lock().await;
    for (field, value) in edits {
        guard.edit_preview(field, value).map_err(flow_error)?;
    }
    Ok(Json(SessionView::of(&guard)))
}

async fn apply_preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, HandlerError> {
    let session = find_session(&state, &id).await?;
    let mut guard = session.lock().await;
    guard.apply().map_err(flow_error)?;
    Ok(Json(SessionView::of(&guard)))
}

async fn cancel_preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, HandlerError> {
    let session = find_session(&state, &id).await?;
    let mut guard = session.lock().await;
    guard.cancel().map_err(flow_error)?;
    Ok(Json(SessionView::of(&guard)))
}

async fn dismiss_no_data(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, HandlerError> {
    let session = find_session(&state, &id).await?;
    let mut guard = session.lock().await;
    guard.dismiss().map_err(flow_error)?;
    Ok(Json(SessionView::of(&guard)))
}

/// Forget the cookie held for the remote scanning endpoint.
async fn clear_upstream_session(State(state): State<AppState>) -> StatusCode {
    state.upstream_cookie.clear();
    info!("Cleared upstream scan session");
    StatusCode::NO_CONTENT
}

// ============================================================================
// Helper functions
// ============================================================================

async fn find_session(state: &AppState, id: &Uuid) -> Result<SharedSession, HandlerError> {
    state
        .sessions
        .get(id)
        .await
        .ok_or((StatusCode::NOT_FOUND, format!("Unknown session: {}", id)))
}

fn flow_error(e: FlowError) -> HandlerError {
    (StatusCode::CONFLICT, e.to_string())
}

/// Resolve field names up front so a bad name rejects the whole edit.
fn parse_edits(edits: HashMap<String, String>) -> Result<Vec<(VehicleField, String)>, HandlerError> {
    edits
        .into_iter()
        .map(|(key, value)| {
            VehicleField::from_key(&key)
                .map(|field| (field, value))
                .ok_or((StatusCode::BAD_REQUEST, format!("Unknown vehicle field: {}", key)))
        })
        .collect()
}

/// Read the `file` part of a multipart upload as a certificate image.
async fn read_image(mut multipart: Multipart) -> Result<ScanImage, HandlerError> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("scan_{}.jpg", Uuid::new_v4()));
        let data = field.bytes().await.map_err(|e| {
            (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
        })?;

        if data.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "Uploaded file is empty".to_string()));
        }

        info!("Received image: {} ({} bytes)", filename, data.len());
        return ScanImage::from_upload(filename, data.to_vec()).ok_or((
            StatusCode::BAD_REQUEST,
            "Unsupported image format".to_string(),
        ));
    }

    Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()))
}
