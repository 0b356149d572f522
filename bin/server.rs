// Group Checklist Sync - Server
// HTTP surface and WebSocket entry point over the checklist service.

use anyhow::Context;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use checklist_sync::{
    Checklist, ChecklistService, Hub, IdentityVerifier, Session, SignedPayloadVerifier, Store,
    SyncError, User,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<ChecklistService>,
    verifier: Arc<dyn IdentityVerifier>,
}

/// API response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        SyncError::Conflict { .. } => StatusCode::CONFLICT,
        SyncError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Store(_) | SyncError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &SyncError) -> Response {
    (
        status_for(error),
        Json(ApiResponse {
            success: false,
            data: (),
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest {
    init_data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    user_id: String,
    is_admin: bool,
}

/// POST /auth - verify the platform handshake and resolve the user
async fn auth(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> impl IntoResponse {
    let Some(identity) = state.verifier.verify(&request.init_data) else {
        warn!("handshake verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiResponse {
                success: false,
                data: (),
                error: Some("unauthenticated".to_string()),
            }),
        )
            .into_response();
    };

    match state.service.authenticate(&identity).await {
        Ok(user) => Json(ApiResponse::ok(AuthResponse {
            user_id: user.id,
            is_admin: user.is_admin,
        }))
        .into_response(),
        Err(error) => error_response(&error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChecklistsQuery {
    group_id: String,
}

/// GET /checklists?groupId= - read-only mirror of the snapshot
async fn get_checklists(
    State(state): State<AppState>,
    Query(query): Query<ChecklistsQuery>,
) -> impl IntoResponse {
    match state.service.snapshot(&query.group_id).await {
        Ok(checklists) => Json(ApiResponse::<Vec<Checklist>>::ok(checklists)).into_response(),
        Err(error) => error_response(&error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    init_data: String,
}

/// GET /ws?initData= - authenticated WebSocket upgrade
async fn ws_entry(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(identity) = state.verifier.verify(&query.init_data) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.service.is_whitelisted(&identity.user_id).await {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let service = state.service.clone();
    upgrade.on_upgrade(move |socket| async move {
        info!(user_id = %identity.user_id, "session connected");
        Session::new(service, identity.user_id).run(socket).await;
    })
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let db_path = std::env::var("CHECKLIST_DB").unwrap_or_else(|_| "checklists.db".to_string());
    let bind = std::env::var("CHECKLIST_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let secret = std::env::var("CHECKLIST_SECRET").context("CHECKLIST_SECRET must be set")?;
    let static_dir =
        PathBuf::from(std::env::var("CHECKLIST_STATIC_DIR").unwrap_or_else(|_| "web".to_string()));

    let store = Store::open(std::path::Path::new(&db_path))
        .with_context(|| format!("failed to open store at {}", db_path))?;
    info!(%db_path, "store opened");

    let service = Arc::new(ChecklistService::load(store, Arc::new(Hub::new())).await?);

    // Seed the deployment admin on first start; later starts keep the
    // persisted directory.
    if let Ok(admin_id) = std::env::var("CHECKLIST_ADMIN") {
        let seeded = service
            .grant_user(
                "",
                User {
                    id: admin_id.clone(),
                    first_name: String::new(),
                    last_name: String::new(),
                    username: String::new(),
                    is_admin: true,
                },
            )
            .await;
        match seeded {
            Ok(()) => info!(%admin_id, "seeded deployment admin"),
            Err(SyncError::Unauthorized(_)) => {} // directory already populated
            Err(error) => return Err(error.into()),
        }
    }

    let state = AppState {
        service,
        verifier: Arc::new(SignedPayloadVerifier::new(secret)),
    };

    let app = Router::new()
        .route("/auth", post(auth))
        .route("/checklists", get(get_checklists))
        .route("/ws", get(ws_entry))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;
    info!(%bind, "server listening");

    axum::serve(listener, app).await.context("server exited")
}
