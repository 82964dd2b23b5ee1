//! HTTP API
//!
//! JSON endpoints under `/api/v1` that map onto [`UpdaterPublicService`],
//! plus a WebSocket at `/api/v1/callback` that registers the connection as
//! the update subscriber. Mutations answer `202 Accepted`; their results
//! arrive as callback frames.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use updater_core::UpdateItemInfo;

use crate::callback::ChannelSubscriber;
use crate::error::ServiceError;
use crate::service::UpdaterPublicService;

/// Shared state for HTTP handlers
pub struct AppState {
    pub service: Arc<UpdaterPublicService>,
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ImportRequest {
    path: PathBuf,
}

#[derive(Serialize)]
struct CancelImportResponse {
    cancelled: bool,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn service_error(e: ServiceError) -> (StatusCode, Json<ApiError>) {
    let status = match &e {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::InvalidState { .. } | ServiceError::Busy(_) | ServiceError::NotInstalling => {
            StatusCode::CONFLICT
        }
        ServiceError::SourceUnavailable(_) => StatusCode::BAD_REQUEST,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(error = %e, status = %status, "Request rejected");
    (status, Json(ApiError::new(e.code(), &e.to_string())))
}

fn accepted(result: Result<(), ServiceError>) -> ApiResult<StatusCode> {
    result.map(|_| StatusCode::ACCEPTED).map_err(service_error)
}

// ============================================================================
// Server
// ============================================================================

/// Start the HTTP API server.
pub async fn run_http_server(
    addr: SocketAddr,
    service: Arc<UpdaterPublicService>,
) -> anyhow::Result<()> {
    let app = build_app_router(Arc::new(AppState { service }));

    info!(address = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
fn build_app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api_routes = Router::new()
        // Updates
        .route("/updates", get(list_updates))
        .route("/updates/check", post(check_for_updates))
        .route("/updates/import", post(import_update))
        .route("/updates/import/cancel", post(cancel_import))
        .route("/updates/:download_id/download", post(download_update))
        .route("/updates/:download_id/pause", post(pause_download))
        .route("/updates/:download_id/resume", post(resume_download))
        .route("/updates/:download_id/install", post(install_update))
        // Running installation
        .route("/install/cancel", post(cancel_install))
        .route("/install/suspend", post(suspend_install))
        .route("/install/resume", post(resume_install))
        // Subscriber
        .route("/callback", get(callback_socket))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_updates(State(state): State<Arc<AppState>>) -> Json<Vec<UpdateItemInfo>> {
    Json(state.service.list_available_updates())
}

async fn check_for_updates(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    accepted(state.service.check_for_updates())
}

async fn download_update(
    State(state): State<Arc<AppState>>,
    Path(download_id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.service.download_update(&download_id))
}

async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(download_id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.service.pause_download(&download_id))
}

async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(download_id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.service.resume_download(&download_id))
}

async fn install_update(
    State(state): State<Arc<AppState>>,
    Path(download_id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.service.install_update(&download_id).await)
}

async fn cancel_install(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    accepted(state.service.cancel_update().await)
}

async fn suspend_install(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    accepted(state.service.suspend_update().await)
}

async fn resume_install(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    accepted(state.service.resume_update().await)
}

async fn import_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<StatusCode> {
    accepted(state.service.import_update(&request.path).await)
}

async fn cancel_import(State(state): State<Arc<AppState>>) -> Json<CancelImportResponse> {
    Json(CancelImportResponse {
        cancelled: state.service.cancel_import(),
    })
}

async fn callback_socket(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_callbacks(socket, state))
}

/// Register the socket as subscriber and pump frames until either side closes.
async fn stream_callbacks(mut socket: WebSocket, state: Arc<AppState>) {
    let (subscriber, mut rx) = ChannelSubscriber::new();
    state.service.set_callback(Arc::new(subscriber));
    info!("Callback subscriber connected");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                // Sender gone: a newer subscriber replaced this one.
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode callback frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("Callback subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use updater_core::{InMemoryRegistry, UpdateRecord, UpdateRegistry};

    use crate::service::tests::test_service;

    fn app(dir: &std::path::Path, registry: Arc<InMemoryRegistry>) -> Router {
        build_app_router(Arc::new(AppState {
            service: Arc::new(test_service(dir, registry)),
        }))
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_list_updates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .add_update(UpdateRecord {
                download_id: "c1a8e3".to_string(),
                version: "16.9".to_string(),
                available_online: true,
                ..Default::default()
            })
            .unwrap();

        let response = app(dir.path(), registry)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/updates")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body[0]["downloadId"], "c1a8e3");
        assert_eq!(body[0]["version"], "16.9");
    }

    #[tokio::test]
    async fn test_check_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/updates/check", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_unknown_update_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/updates/nope/download", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_cancel_without_install_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/install/cancel", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "not_installing");
    }

    #[tokio::test]
    async fn test_import_missing_file_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.zip");
        let body = serde_json::json!({ "path": missing }).to_string();

        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/updates/import", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "source_unavailable");
    }

    #[tokio::test]
    async fn test_cancel_without_import() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/updates/import/cancel", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["cancelled"], false);
    }

    #[tokio::test]
    async fn test_import_existing_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("package.zip");
        std::fs::write(&package, b"payload").unwrap();
        let body = serde_json::json!({ "path": package }).to_string();

        let response = app(dir.path(), Arc::new(InMemoryRegistry::new()))
            .oneshot(post("/api/v1/updates/import", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
