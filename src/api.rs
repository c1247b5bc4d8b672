//! HTTP surface: routes, extractors and the middleware stack around them.

use std::{
    collections::HashSet,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        ConnectInfo, DefaultBodyLimit, FromRequest, MatchedPath, Path, Request, State,
        rejection::JsonRejection,
    },
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{
            CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, REFERRER_POLICY,
            X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
        },
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, warn};
use url::Url;

use crate::{
    config::AppConfig,
    engine::{DownloadEngine, VideoInfo, describe_failure},
    error::ApiError,
    history::{DownloadHistory, HISTORY_RESPONSE_LIMIT, HistoryEntry},
    rate_limit::{RateLimiter, RouteBucket},
    tracker::{SessionRecord, SessionStatus, SessionTracker},
    validation::{
        sanitize_string, validate_download_id, validate_format, validate_quality, validate_url,
        MAX_URL_LENGTH,
    },
    worker::{DownloadRequest, DownloadWorker},
};

pub const MAX_REQUEST_BODY_BYTES: usize = 2048;

const REQUEST_ID_HEADER: &str = "x-request-id";
const DOWNLOAD_FILENAME_HEADER: &str = "x-download-filename";

const SUPPORTED_SITES: [&str; 18] = [
    "YouTube",
    "Vimeo",
    "TikTok",
    "Twitter/X",
    "Instagram",
    "Facebook",
    "Dailymotion",
    "Twitch",
    "Reddit",
    "SoundCloud",
    "Bandcamp",
    "VK",
    "Rumble",
    "Odysee",
    "Bilibili",
    "Niconico",
    "Archive.org",
    "And 1000+ more sites...",
];

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct AppState {
    pub tracker: SessionTracker,
    pub history: DownloadHistory,
    pub worker: DownloadWorker,
    pub engine: Arc<dyn DownloadEngine>,
    pub rate_limiter: RateLimiter,
    pub download_dir: PathBuf,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(config: &AppConfig, engine: Arc<dyn DownloadEngine>) -> Self {
        let tracker = SessionTracker::new(config.session_retention);
        let history = DownloadHistory::default();
        let worker = DownloadWorker::new(
            Arc::clone(&engine),
            tracker.clone(),
            history.clone(),
            Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            config.download_dir.clone(),
        );

        Self {
            tracker,
            history,
            worker,
            engine,
            rate_limiter: RateLimiter::default(),
            download_dir: config.download_dir.clone(),
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadPayload {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoPayload {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadStarted {
    success: bool,
    download_id: String,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    success: bool,
    #[serde(flatten)]
    info: VideoInfo,
}

#[derive(Debug, Serialize)]
struct DownloadedFile {
    name: String,
    size: u64,
    modified: DateTime<Utc>,
}

/// `Json<T>` with rejections mapped onto the API's error body.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(request, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(JsonRejection::MissingJsonContentType(_)) => {
                Err(ApiError::bad_request("Content-Type must be application/json"))
            }
            Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                Err(ApiError::request_too_large())
            }
            Err(rejection) => {
                debug!("JSON rechazado: {rejection}");
                Err(ApiError::bad_request("Invalid JSON format")
                    .with_suggestion("Please check your request format"))
            }
        }
    }
}

pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/download", post(start_download))
        .route("/api/progress/{download_id}", get(get_progress))
        .route("/api/info", post(fetch_info))
        .route("/api/history", get(get_history))
        .route("/api/downloads", get(list_downloads))
        .route("/api/supported-sites", get(supported_sites))
        .route("/api/file/{download_id}", get(serve_file))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limit,
        ))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("permissions-policy"),
            HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");
            info_span!(
                "request",
                method = %request.method(),
                uri = %request.uri(),
                request_id
            )
        }))
        .layer(middleware::from_fn(assign_request_id))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn start_download(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<DownloadPayload>,
) -> Result<Json<DownloadStarted>, ApiError> {
    let url = required_url(payload.url.as_deref())?;
    check_url(&url)?;

    let quality = validate_quality(payload.quality.as_deref())
        .ok_or_else(|| ApiError::bad_request("Invalid quality parameter"))?;
    let mode = validate_format(payload.format.as_deref())
        .ok_or_else(|| ApiError::bad_request("Invalid format parameter"))?;

    let download_id = state
        .worker
        .start(DownloadRequest { url, quality, mode })
        .await
        .map_err(|duplicate| {
            error!("Invariante rota al registrar la descarga: {duplicate}");
            ApiError::internal("No se pudo registrar la descarga.")
        })?;

    Ok(Json(DownloadStarted {
        success: true,
        download_id,
        message: "Download started",
    }))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let download_id = validate_download_id(&raw_id)
        .ok_or_else(|| ApiError::bad_request("Invalid download ID"))?;

    state
        .tracker
        .get(&download_id)
        .await
        .map(Json)
        .ok_or_else(ApiError::download_not_found)
}

async fn fetch_info(
    State(state): State<AppState>,
    ValidJson(payload): ValidJson<InfoPayload>,
) -> Result<Json<InfoResponse>, ApiError> {
    let url = required_url(payload.url.as_deref())?;
    check_url(&url).map_err(|error| error.with_details("Please provide a valid HTTP/HTTPS URL"))?;

    match state.engine.fetch_info(&url).await {
        Ok(info) => Ok(Json(InfoResponse {
            success: true,
            info,
        })),
        Err(engine_error) => {
            warn!("No se pudo obtener informacion de {url}: {engine_error}");
            let hint = describe_failure(&engine_error);
            let mut error = ApiError::internal(hint.message).with_details(engine_error.to_string());
            if let Some(suggestion) = hint.suggestion {
                error = error.with_suggestion(suggestion);
            }
            Err(error)
        }
    }
}

async fn get_history(State(state): State<AppState>) -> Json<Vec<HistoryEntry>> {
    Json(state.history.recent(HISTORY_RESPONSE_LIMIT).await)
}

async fn list_downloads(
    State(state): State<AppState>,
) -> Result<Json<Vec<DownloadedFile>>, ApiError> {
    let mut files = Vec::new();
    collect_artifacts(&state.download_dir, &mut files)
        .await
        .map_err(|error| ApiError::internal(format!("No se pudo listar las descargas: {error}")))?;

    let mut entries = match tokio::fs::read_dir(&state.download_dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Json(files)),
        Err(error) => {
            return Err(ApiError::internal(format!(
                "No se pudo listar las descargas: {error}"
            )));
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if entry.file_type().await.is_ok_and(|kind| kind.is_dir())
            && let Err(error) = collect_artifacts(&path, &mut files).await
        {
            debug!("Carpeta {:?} omitida del listado: {error}", path);
        }
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(Json(files))
}

async fn supported_sites() -> Json<[&'static str; 18]> {
    Json(SUPPORTED_SITES)
}

async fn serve_file(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let download_id = validate_download_id(&raw_id)
        .ok_or_else(|| ApiError::bad_request("Invalid download ID"))?;
    let record = state
        .tracker
        .get(&download_id)
        .await
        .ok_or_else(ApiError::download_not_found)?;

    let file_path = match (record.status, record.file_path) {
        (SessionStatus::Completed, Some(path)) => path,
        _ => {
            return Err(ApiError::not_found("File not found")
                .with_suggestion("The download has not finished yet"));
        }
    };

    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "No se pudo leer el archivo descargado: {error}"
            )));
        }
    };
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("No se pudo leer metadata del archivo: {error}"))
    })?;

    let filename = record
        .filename
        .or_else(|| {
            file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "download.bin".to_string());

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("No se pudo crear el tamano de descarga."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear la cabecera de descarga."))?,
    );
    headers.insert(
        HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
        HeaderValue::from_str(&sanitize_ascii_filename(&filename))
            .map_err(|_| ApiError::internal("No se pudo crear el nombre del archivo."))?,
    );

    info!("Sirviendo {filename} de la sesion {download_id}");
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

fn required_url(value: Option<&str>) -> Result<String, ApiError> {
    value
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| sanitize_string(url, MAX_URL_LENGTH + 1))
        .ok_or_else(|| ApiError::bad_request("Missing required fields: url"))
}

fn check_url(url: &str) -> Result<(), ApiError> {
    validate_url(url)
        .map(|_| ())
        .map_err(|rejection| ApiError::bad_request("Invalid URL").with_suggestion(rejection.message()))
}

async fn collect_artifacts(dir: &FsPath, files: &mut Vec<DownloadedFile>) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || name.ends_with(".part") || name.ends_with(".ytdl") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        files.push(DownloadedFile {
            name,
            size: metadata.len(),
            modified: metadata.modified().map(DateTime::<Utc>::from)?,
        });
    }

    Ok(())
}

async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(bucket) = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|path| RouteBucket::from_route(path.as_str()))
    else {
        return next.run(request).await;
    };

    let client_ip =
        client_ip_for_request(state.trust_proxy_headers, request.headers(), peer_addr(&request));
    if let Err(retry_after) = state.rate_limiter.check(&client_ip, bucket, Utc::now()).await {
        warn!("Limite de solicitudes excedido para {client_ip}");
        return ApiError::rate_limited(retry_after).into_response();
    }

    next.run(request).await
}

async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = generate_request_id(peer_addr(&request));
    let Ok(value) = HeaderValue::from_str(&request_id) else {
        return next.run(request).await;
    };

    request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
    response
}

fn generate_request_id(peer: SocketAddr) -> String {
    let sequence = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(Utc::now().timestamp_micros().to_string().as_bytes());
    hasher.update(b":");
    hasher.update(peer.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(sequence.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

fn peer_addr(request: &Request) -> SocketAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(first_ip) = check_header("x-forwarded-for").and_then(|forwarded| {
        forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    }) {
        return Some(first_ip);
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

fn client_ip_for_request(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

/// Allow-list CORS when origins are configured, any origin otherwise.
pub fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .expose_headers([
            CONTENT_DISPOSITION,
            HeaderName::from_static(DOWNLOAD_FILENAME_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ]);

    if configured.is_empty() {
        warn!("ALLOWED_ORIGINS no esta configurado. Se aceptara cualquier origen.");
        return Ok(layer.allow_origin(Any));
    }

    let allowed_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Origen invalido en ALLOWED_ORIGINS: {origin}. Usa valores tipo https://dominio.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list cargada con {} origen(es): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    Ok(layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(normalize_origin)
                .is_some_and(|value| allowed_origins.contains(&value))
        },
    )))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|port| *port != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric()
                || matches!(character, '.' | '-' | '_' | ' ' | '(' | ')')
            {
                character
            } else {
                '_'
            }
        })
        .collect::<String>();

    match sanitized.trim() {
        "" => "download.bin".to_string(),
        compact => compact.to_string(),
    }
}
