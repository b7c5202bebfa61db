use std::{fmt::Write as _, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use photoframe_service::{BucketListing, PhotoService, ServiceStatus, StoredImage};
use photoframe_types::{
    device::{ClientKey, MacAddress},
    PhotoframeError, Result,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    service: Arc<PhotoService>,
    require_mac: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PixelQuery {
    n: Option<String>,
    mac: Option<String>,
}

/// Largest accepted photo upload.
pub const UPLOAD_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct BucketQuery {
    bucket: Option<String>,
}

/// Error body plus the status code the chunk protocol promises for it.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

}

impl From<PhotoframeError> for ApiError {
    fn from(err: PhotoframeError) -> Self {
        let status = match &err {
            PhotoframeError::Range { .. } | PhotoframeError::InvalidImageName { .. } => {
                StatusCode::BAD_REQUEST
            }
            PhotoframeError::UnknownBucket { .. } | PhotoframeError::ImageNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            PhotoframeError::NoContent { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &err {
            PhotoframeError::Sequence => "Start with n=0 or image conversion failed".to_string(),
            other => other.to_string(),
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub fn router(service: Arc<PhotoService>, require_mac: bool) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/pixel", get(pixel))
        .route("/list", get(list))
        .route("/images/:file", get(image))
        .route("/delete/:file", delete(remove))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .with_state(AppState {
            service,
            require_mac,
        })
}

/// Serve the chunk protocol until the listener fails.
pub async fn serve_chunks(
    listener: TcpListener,
    service: Arc<PhotoService>,
    require_mac: bool,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Chunk server listening on http://{addr}/pixel");
    }
    let app = router(service, require_mac);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| PhotoframeError::Network(format!("chunk server stopped: {err}")))
}

async fn pixel(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<PixelQuery>,
) -> std::result::Result<Response, ApiError> {
    let raw = query
        .n
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Missing 'n' parameter"))?;
    let n: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid n"))?;

    let key = match query.mac.as_deref() {
        Some(mac) => ClientKey::Device(
            mac.trim()
                .parse::<MacAddress>()
                .map_err(|_| ApiError::bad_request(format!("Invalid mac {mac:?}")))?,
        ),
        None if state.require_mac => {
            return Err(ApiError::bad_request("Missing 'mac' parameter"));
        }
        None => ClientKey::Address(peer.ip().to_canonical()),
    };

    match state.service.get_chunk(&key, n).await {
        Ok(chunk) => {
            debug!("[{}] chunk {}", key, n);
            Ok((
                [(header::CONTENT_TYPE, "application/octet-stream")],
                chunk,
            )
                .into_response())
        }
        Err(err) => {
            let api = ApiError::from(err);
            if api.status.is_server_error() {
                warn!("[{}] chunk {} failed: {}", key, n, api.message);
            } else {
                debug!("[{}] chunk {} rejected: {}", key, n, api.message);
            }
            Err(api)
        }
    }
}

async fn list(
    State(state): State<AppState>,
    Query(query): Query<BucketQuery>,
) -> std::result::Result<Json<BucketListing>, ApiError> {
    Ok(Json(state.service.list_images(query.bucket.as_deref())?))
}

async fn image(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<BucketQuery>,
) -> std::result::Result<Response, ApiError> {
    let bytes = state
        .service
        .image_bytes(query.bucket.as_deref(), &file)
        .await?;
    Ok(([(header::CONTENT_TYPE, image_content_type(&file))], bytes).into_response())
}

async fn remove(
    State(state): State<AppState>,
    Path(file): Path<String>,
    Query(query): Query<BucketQuery>,
) -> std::result::Result<String, ApiError> {
    state
        .service
        .delete_image(query.bucket.as_deref(), &file)
        .await?;
    Ok(format!("{file} deleted"))
}

/// Accepts a multipart form with the photo in an `image` (or `file`) field.
async fn upload(
    State(state): State<AppState>,
    Query(query): Query<BucketQuery>,
    mut multipart: Multipart,
) -> std::result::Result<Json<StoredImage>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("Malformed upload: {err}")))?
    {
        if !matches!(field.name(), Some("image" | "file")) {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let Some((_, extension)) = file_name.rsplit_once('.') else {
            return Err(ApiError::bad_request("Upload needs a file name with an image extension"));
        };
        let extension = extension.to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("Malformed upload: {err}")))?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("Empty upload"));
        }
        let stored = state
            .service
            .upload(query.bucket.as_deref(), &extension, &bytes)
            .await?;
        return Ok(Json(stored));
    }
    Err(ApiError::bad_request("No 'image' field in upload"))
}

fn image_content_type(file: &str) -> &'static str {
    let extension = file
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(state.service.status())
}

async fn index(State(state): State<AppState>) -> String {
    render_status(&state.service.status())
}

fn render_status(status: &ServiceStatus) -> String {
    let mut out = String::new();
    let last = status.total_chunks.saturating_sub(1);
    let _ = writeln!(out, "photoframe RGB565 chunk server");
    let _ = writeln!(
        out,
        "Serving {}x{} images as {} chunks of {} bytes",
        status.raster.width, status.raster.height, status.total_chunks, status.chunk_size
    );
    let _ = writeln!(
        out,
        "Use: /pixel?n=0 ... /pixel?n={last} (add &mac=AA:BB:CC:DD:EE:FF to identify the device)"
    );
    let _ = writeln!(
        out,
        "Photos: POST /upload, DELETE /delete/<file>, /images/<file>, /list (add ?bucket=NAME)"
    );
    let _ = writeln!(
        out,
        "Up since {}",
        status.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let _ = writeln!(out, "\nBuckets (default {}):", status.default_bucket);
    for bucket in &status.buckets {
        let _ = writeln!(
            out,
            "  {:<12} {} photos ({} selectable) in {}",
            bucket.name,
            bucket.images.len(),
            bucket.selectable,
            bucket.dir.display()
        );
    }

    let _ = writeln!(out, "\nActive sessions: {}", status.sessions.len());
    for session in &status.sessions {
        let _ = writeln!(
            out,
            "  {} -> {} : {} (idle {}s)",
            session.client, session.bucket, session.image, session.idle_secs
        );
    }

    let _ = writeln!(
        out,
        "\nDevices ({} address bindings, {} cached rasters):",
        status.bound_addresses, status.cached_rasters
    );
    for device in &status.devices {
        let seen = match (device.last_registered, device.last_address) {
            (Some(at), Some(ip)) => format!(
                "last registered {} from {ip}",
                at.format("%Y-%m-%d %H:%M:%S")
            ),
            _ => "never seen".to_string(),
        };
        let _ = writeln!(
            out,
            "  {} {:<22} {:<12} {}",
            device.mac,
            device.name.as_deref().unwrap_or("Unknown device"),
            device.bucket.as_deref().unwrap_or(&status.default_bucket),
            seen
        );
    }
    out
}
