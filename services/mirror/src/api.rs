use crate::config::ApiConfig;
use crate::event::ImagePayload;
use crate::hub::HubHandle;
use crate::image_cache::ImageCache;
use crate::key::FormattedKey;
use crate::mirror::{ImageInfos, Mirror};
use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

/// Interval between keep-alive pings on event streams
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<Mirror>,
    pub hub: HubHandle,
}

/// Most recent images, newest first
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<ImagePayload>,
    pub total_count: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{what} not found"),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

fn internal(error: &str, code: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/images", get(list_images))
        .route("/image/:key", get(get_image))
        .route("/infos/:key", get(get_infos))
        .route("/thumbnails/:key", get(get_thumbnail))
        .route("/cache/:dir/:file", get(get_cached_file))
        .route("/reload", get(reload).post(reload))
        .route("/ws", get(event_stream));

    let base_path = config.base_path.trim_end_matches('/');
    let router = if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(base_path, routes)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "mirror-service",
        "images": state.mirror.images().len(),
        "subscribers": state.hub.subscriber_count(),
    }))
}

/// Most recent cached images
async fn list_images(State(state): State<AppState>) -> Json<ImageListResponse> {
    let images = state
        .mirror
        .images()
        .to_event_payloads(state.mirror.settings().max_display_count);

    Json(ImageListResponse {
        total_count: state.mirror.images().len(),
        images,
    })
}

/// Raw bytes of a cached image
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    serve_record(state.mirror.images(), &FormattedKey::from_formatted(key), "Image").await
}

/// Raw bytes of a cached thumbnail
#[instrument(skip(state))]
async fn get_thumbnail(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    serve_record(state.mirror.thumbnails(), &FormattedKey::from_formatted(key), "Thumbnail").await
}

/// Details of one image: date, links, location, features, thumbnails
#[instrument(skip(state))]
async fn get_infos(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ImageInfos>, ApiError> {
    state
        .mirror
        .image_infos(&FormattedKey::from_formatted(key))
        .await
        .map(Json)
        .ok_or_else(|| not_found("Image"))
}

/// A side-file stored in the main cache, addressed by formatted directory and name
#[instrument(skip(state))]
async fn get_cached_file(
    State(state): State<AppState>,
    Path((dir, file)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !is_cache_segment(&dir) || !is_cache_segment(&file) {
        return Err(not_found("File"));
    }

    let key = FormattedKey::from_formatted(format!("{dir}@{file}"));
    serve_file(state.mirror.images(), &key, "File").await
}

/// Drop the whole cache; subscribers receive a reset
#[instrument(skip(state))]
async fn reload(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.mirror.reload().await.map_err(|e| {
        error!(error = %e, "Failed to reload cache");
        internal("Failed to reload cache", "RELOAD_ERROR")
    })?;

    Ok(Json(serde_json::json!({ "status": "reloaded" })))
}

/// A decoded path segment that stays inside the cache directory once joined
fn is_cache_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(['/', '\\']) && !segment.contains("..")
}

async fn serve_record(
    cache: &ImageCache,
    key: &FormattedKey,
    what: &str,
) -> Result<impl IntoResponse, ApiError> {
    if cache.find_by_formatted_key(key).is_none() {
        return Err(not_found(what));
    }
    serve_file(cache, key, what).await
}

async fn serve_file(
    cache: &ImageCache,
    key: &FormattedKey,
    what: &str,
) -> Result<impl IntoResponse, ApiError> {
    let path = cache.path_for(key);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(what)),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to read cached file");
            return Err(internal("Failed to read cached file", "IO_ERROR"));
        }
    };

    Ok(([(header::CONTENT_TYPE, content_type(key.as_str()))], bytes))
}

fn content_type(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "json" | "geojson" => "application/json",
        "kml" => "application/vnd.google-earth.kml+xml",
        _ => "application/octet-stream",
    }
}

/// Live domain events over a WebSocket
async fn event_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_events(socket, state.hub))
}

async fn stream_events(socket: WebSocket, hub: HubHandle) {
    let mut subscription = match hub.subscribe().await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(error = %e, "Refusing event stream");
            return;
        }
    };
    let id = subscription.id();
    debug!(subscriber = %id, "Event stream opened");

    let (mut sender, mut receiver) = socket.split();
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await;

    loop {
        tokio::select! {
            event = subscription.recv() => {
                // None once the hub dropped a slow subscriber
                let Some(event) = event else { break };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    debug!(subscriber = %id, "Event stream closed");
}

/// Start the HTTP server; returns once `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting mirror API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
