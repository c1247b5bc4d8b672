use std::{path::PathBuf, time::Duration};

use tracing::warn;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
const DEFAULT_SESSION_RETENTION_SECONDS: u64 = 60 * 60;
const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 30 * 60;

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub session_retention: Duration,
    pub cleanup_interval: Duration,
    pub yt_dlp_bin: PathBuf,
    pub yt_dlp_timeout: Duration,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let download_dir = std::env::var("DOWNLOAD_DIR")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(default_download_dir);

        let max_concurrent_downloads = read_usize_env("MAX_CONCURRENT_DOWNLOADS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS);

        let session_retention = read_u64_env("SESSION_RETENTION_SECONDS")
            .unwrap_or(DEFAULT_SESSION_RETENTION_SECONDS);
        let cleanup_interval = read_u64_env("CLEANUP_INTERVAL_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECONDS);
        let yt_dlp_timeout = read_u64_env("YT_DLP_TIMEOUT_SECONDS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_YT_DLP_TIMEOUT_SECONDS);

        let yt_dlp_bin = std::env::var("YT_DLP_BIN")
            .ok()
            .and_then(|value| non_empty(&value).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Self {
            bind_addr: resolve_bind_addr(),
            download_dir,
            max_concurrent_downloads,
            session_retention: Duration::from_secs(session_retention),
            cleanup_interval: Duration::from_secs(cleanup_interval),
            yt_dlp_bin,
            yt_dlp_timeout: Duration::from_secs(yt_dlp_timeout),
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            download_dir: default_download_dir(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            session_retention: Duration::from_secs(DEFAULT_SESSION_RETENTION_SECONDS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECONDS),
            yt_dlp_bin: PathBuf::from("yt-dlp"),
            yt_dlp_timeout: Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS),
            trust_proxy_headers: false,
            allowed_origins: Vec::new(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    match std::env::current_dir() {
        Ok(dir) => dir.join("downloads"),
        Err(error) => {
            warn!("No se pudo leer el directorio actual, se usara ./downloads: {error}");
            PathBuf::from("downloads")
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn read_bool_env(name: &str) -> Option<bool> {
    parse_bool(&std::env::var(name).ok()?)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
