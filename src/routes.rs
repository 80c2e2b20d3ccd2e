use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Multipart, Path as AxumPath, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    credentials::CredentialStore,
    error::{ApiError, DownloadError},
    orchestrator::{DownloadOutcome, DownloadRequest, Downloader},
};

const COOKIE_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    pub downloader: Arc<Downloader>,
    pub credentials: CredentialStore,
    pub download_dir: PathBuf,
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/upload-cookies", post(upload_cookies))
        .route("/download", post(download))
        .route("/file/{name}", get(serve_file))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "yt-dlp backend running",
        "cookies_present": state.credentials.exists().await,
    }))
}

async fn upload_cookies(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut multipart = multipart.map_err(|rejection| {
        ApiError::bad_request(format!("Invalid multipart body: {}", rejection.body_text()))
    })?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(format!("Invalid multipart body: {error}")))?
    {
        if field.name() != Some(COOKIE_FIELD) {
            continue;
        }

        let blob = field
            .bytes()
            .await
            .map_err(|error| ApiError::bad_request(format!("Could not read upload: {error}")))?;
        if blob.is_empty() {
            break;
        }

        let fingerprint = state.credentials.store(&blob).await?;
        return Ok(Json(json!({
            "status": "cookies stored",
            "using": state.credentials.path().to_string_lossy(),
            "sha256": fingerprint,
        })));
    }

    Err(ApiError::bad_request("cookies.txt file required"))
}

async fn download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload
        .map_err(|rejection| ApiError::bad_request(format!("Invalid JSON body: {}", rejection.body_text())))?;

    match state.downloader.download(request).await? {
        DownloadOutcome::Preview(info) => Ok(Json(json!({ "info": info })).into_response()),
        DownloadOutcome::Stored(stored) => Ok(Json(stored).into_response()),
    }
}

async fn serve_file(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> Result<Response, ApiError> {
    if !is_plain_file_name(&name) {
        debug!("Rejected file name {:?}", name);
        return Err(DownloadError::NotFound.into());
    }

    let path = state.download_dir.join(&name);
    // The sweeper may delete the file at any point; every failure here is a 404.
    let file = tokio::fs::File::open(&path).await.map_err(|error| {
        if error.kind() != ErrorKind::NotFound {
            warn!("Could not open stored file {:?}: {error}", path);
        }
        ApiError::from(DownloadError::NotFound)
    })?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::from(DownloadError::NotFound))?;
    if !metadata.is_file() {
        return Err(DownloadError::NotFound.into());
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&name)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&name))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|file_name| file_name == name)
}

pub fn build_cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, ApiError> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if allowed_origins.is_empty() {
        warn!("ALLOWED_ORIGINS is not set. Accepting requests from any origin.");
        return Ok(base.allow_origin(Any));
    }

    let normalized_origins = allowed_origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!("CORS allow-list loaded with {} origin(s)", normalized_origins.len());

    let normalized_origins = Arc::new(normalized_origins);
    Ok(base.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(normalize_origin)
                .is_some_and(|value| normalized_origins.contains(&value))
        },
    )))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already drops the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
