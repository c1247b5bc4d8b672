//! Adapter over the external `yt-dlp` executable.
//!
//! The rest of the crate only sees [`DownloadEngine`]: metadata lookups and
//! downloads that push [`EngineProgress`] events while they run.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, mpsc},
    time::{Duration, timeout},
};
use tracing::{debug, info, warn};

const INFO_TIMEOUT_SECONDS: u64 = 180;
const MAX_LISTED_HEIGHTS: usize = 10;
const STDERR_TAIL_LINES: usize = 20;

const PROGRESS_MARKER: &str = "DLPROG|";
const POSTPROCESS_MARKER: &str = "DLPOST|";
const OUTPUT_MARKER: &str = "DLFILE|";
const FORMAT_MARKER: &str = "DLFMT|";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quality {
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
}

impl Quality {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" => Some(Self::Best),
            "4k" => Some(Self::Uhd4k),
            "1080p" => Some(Self::P1080),
            "720p" => Some(Self::P720),
            "480p" => Some(Self::P480),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Uhd4k => "4k",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
        }
    }

    fn video_selector(self) -> &'static str {
        match self {
            Self::Best => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best[ext=mp4]/best",
            Self::Uhd4k => {
                "bestvideo[height>=2160][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height>=2160]+bestaudio/best[height>=2160]/bestvideo+bestaudio/best"
            }
            Self::P1080 => {
                "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=1080]+bestaudio/best[height<=1080]/best"
            }
            Self::P720 => {
                "bestvideo[height<=720][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=720]+bestaudio/best[height<=720]/best"
            }
            Self::P480 => {
                "bestvideo[height<=480][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=480]+bestaudio/best[height<=480]/best"
            }
        }
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Video,
    Audio,
}

impl DownloadMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub quality: Quality,
    pub mode: DownloadMode,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: f64,
    pub thumbnail: String,
    pub uploader: String,
    pub description: String,
    pub view_count: u64,
    pub formats: Vec<HeightOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeightOption {
    pub quality: String,
    pub height: u32,
    pub ext: String,
}

/// Progress as yt-dlp reports it. A merged download writes one stream per
/// selected format, each with its own byte counter and `finished` line.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineProgress {
    /// Number of streams the selected format writes (`137+140` is two).
    Formats {
        streams: usize,
    },
    Downloading {
        downloaded: u64,
        total: Option<u64>,
        speed: Option<f64>,
        eta: Option<u64>,
        filename: Option<String>,
    },
    StreamFinished {
        filename: Option<String>,
    },
    /// A postprocessor (merger, audio extraction) is running.
    Processing {
        filename: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotInstalled,
    TimedOut(u64),
    Failed(String),
    InvalidOutput(String),
    Io(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInstalled => write!(f, "yt-dlp no esta instalado en el sistema"),
            Self::TimedOut(seconds) => write!(f, "yt-dlp excedio el tiempo limite de {seconds}s"),
            Self::Failed(message) => write!(f, "{message}"),
            Self::InvalidOutput(message) => write!(f, "salida invalida de yt-dlp: {message}"),
            Self::Io(message) => write!(f, "error de E/S: {message}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[async_trait]
pub trait DownloadEngine: Send + Sync {
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo, EngineError>;

    /// Runs a download to completion, sending progress while it goes, and
    /// returns the final artifact path inside `job.output_dir`.
    async fn download(
        &self,
        job: &DownloadJob,
        progress: mpsc::Sender<EngineProgress>,
    ) -> Result<PathBuf, EngineError>;
}

/// Human-facing explanation of an engine failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureHint {
    pub message: String,
    pub suggestion: Option<&'static str>,
}

pub fn describe_failure(error: &EngineError) -> FailureHint {
    let raw = match error {
        EngineError::NotInstalled => {
            return FailureHint {
                message: "yt-dlp no esta instalado en el servidor.".to_string(),
                suggestion: Some("Instala yt-dlp y reinicia el backend."),
            };
        }
        EngineError::TimedOut(_) => {
            return FailureHint {
                message: "La operacion excedio el tiempo limite.".to_string(),
                suggestion: Some("Intenta con otra URL o con una calidad menor."),
            };
        }
        EngineError::Failed(message)
        | EngineError::InvalidOutput(message)
        | EngineError::Io(message) => message.as_str(),
    };
    let lower = raw.to_ascii_lowercase();

    let (message, suggestion) = if is_drm_error(raw) {
        (
            "Contenido protegido con DRM, no se puede descargar.",
            Some("Usa la aplicacion oficial del servicio (Netflix, Disney+, etc.)."),
        )
    } else if is_login_error(raw) || lower.contains("cookies") || lower.contains("nsfw") {
        (
            "Este contenido requiere iniciar sesion.",
            Some("Exporta las cookies de tu navegador para acceder a contenido privado."),
        )
    } else if raw.contains("Unsupported URL") || raw.contains("No video formats found") {
        (
            "Sitio no soportado o URL incorrecta.",
            Some("Actualiza yt-dlp: pip install --upgrade yt-dlp"),
        )
    } else if raw.contains("HTTP Error 404") {
        (
            "Video no encontrado (404). Puede haber sido eliminado o la URL es incorrecta.",
            Some("Revisa la URL y vuelve a intentarlo."),
        )
    } else if raw.contains("Unable to extract") || raw.contains("Failed to parse") {
        (
            "Fallo la extraccion. El formato del sitio puede haber cambiado.",
            Some("Actualiza yt-dlp: pip install --upgrade yt-dlp"),
        )
    } else if raw.contains("Cloudflare") || raw.contains("HTTP Error 403") || raw.contains("impersonate")
    {
        (
            "El sitio esta protegido contra bots (Cloudflare).",
            Some("Instala curl-cffi junto a yt-dlp y reinicia el backend."),
        )
    } else {
        return FailureHint {
            message: raw.to_string(),
            suggestion: Some("Actualiza yt-dlp: pip install --upgrade yt-dlp"),
        };
    };

    FailureHint {
        message: message.to_string(),
        suggestion,
    }
}

fn is_drm_error(message: &str) -> bool {
    message.contains("DRM") || message.to_ascii_lowercase().contains("drm protection")
}

fn is_login_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("need to log in") || lower.contains("login required")
}

pub struct YtDlpEngine {
    binary: PathBuf,
    download_timeout: Duration,
}

impl YtDlpEngine {
    pub fn new(binary: impl Into<PathBuf>, download_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            download_timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<std::process::Output, EngineError> {
        let command_future = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(Duration::from_secs(INFO_TIMEOUT_SECONDS), command_future)
            .await
            .map_err(|_| EngineError::TimedOut(INFO_TIMEOUT_SECONDS))?
            .map_err(spawn_error)?;

        if !output.status.success() {
            return Err(EngineError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }

    async fn extract_info(&self, url: &str, force_generic: bool) -> Result<VideoInfo, EngineError> {
        let mut args = vec![
            "-J".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--retries".to_string(),
            "5".to_string(),
            "--extractor-retries".to_string(),
            "3".to_string(),
        ];
        if force_generic {
            args.push("--force-generic-extractor".to_string());
        }
        args.push(url.to_string());

        let output = self.run(args).await?;
        let info: YtDlpVideoInfo = serde_json::from_slice(&output.stdout)
            .map_err(|error| EngineError::InvalidOutput(error.to_string()))?;
        Ok(info.into_video_info())
    }
}

#[async_trait]
impl DownloadEngine for YtDlpEngine {
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo, EngineError> {
        let primary_error = match self.extract_info(url, false).await {
            Ok(info) => return Ok(info),
            Err(error) => error,
        };

        if let EngineError::Failed(message) = &primary_error {
            if is_drm_error(message) || is_login_error(message) {
                return Err(primary_error);
            }
        } else {
            return Err(primary_error);
        }

        warn!("Extraccion fallida para {url:?}, reintentando con el extractor generico: {primary_error}");
        match self.extract_info(url, true).await {
            Ok(info) => {
                info!("El extractor generico resolvio {url:?}");
                Ok(info)
            }
            Err(generic_error) => {
                debug!("El extractor generico tambien fallo: {generic_error}");
                Err(primary_error)
            }
        }
    }

    async fn download(
        &self,
        job: &DownloadJob,
        progress: mpsc::Sender<EngineProgress>,
    ) -> Result<PathBuf, EngineError> {
        let mut child = Command::new(&self.binary)
            .args(build_download_args(job))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Io("no se pudo capturar stdout de yt-dlp".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Io("no se pudo capturar stderr de yt-dlp".to_string()))?;

        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr_reader = {
            let stderr_tail = Arc::clone(&stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = stderr_tail.lock().await;
                    tail.push(line);
                    if tail.len() > STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                }
            })
        };

        let run = async {
            let mut printed_path = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|error| EngineError::Io(error.to_string()))?
            {
                match parse_output_line(&line) {
                    Some(OutputLine::Progress(event)) => {
                        let _ = progress.send(event).await;
                    }
                    Some(OutputLine::Artifact(path)) => printed_path = Some(path),
                    None => {}
                }
            }
            let status = child
                .wait()
                .await
                .map_err(|error| EngineError::Io(error.to_string()))?;
            Ok::<_, EngineError>((status, printed_path))
        };

        let (status, printed_path) = match timeout(self.download_timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                stderr_reader.abort();
                return Err(EngineError::TimedOut(self.download_timeout.as_secs()));
            }
        };
        let _ = stderr_reader.await;

        if !status.success() {
            let tail = stderr_tail.lock().await.join("\n");
            return Err(EngineError::Failed(run_error_message(tail.as_bytes())));
        }

        locate_artifact(&job.output_dir, printed_path.as_deref()).await
    }
}

fn spawn_error(error: std::io::Error) -> EngineError {
    if error.kind() == ErrorKind::NotFound {
        EngineError::NotInstalled
    } else {
        EngineError::Io(format!("no se pudo ejecutar yt-dlp: {error}"))
    }
}

pub fn build_download_args(job: &DownloadJob) -> Vec<String> {
    let output_template = format!(
        "{}/%(title).140B.%(ext)s",
        job.output_dir.to_string_lossy()
    );

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_MARKER}%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s|%(progress.filename)s"
        ),
        "--progress-template".to_string(),
        format!("postprocess:{POSTPROCESS_MARKER}%(progress.status)s|%(progress.postprocessor)s"),
        "--print".to_string(),
        format!("before_dl:{FORMAT_MARKER}%(format_id)s"),
        "--print".to_string(),
        format!("after_move:{OUTPUT_MARKER}%(filepath)s"),
        "--retries".to_string(),
        "10".to_string(),
        "--fragment-retries".to_string(),
        "10".to_string(),
        "--extractor-retries".to_string(),
        "5".to_string(),
        "--skip-unavailable-fragments".to_string(),
        "--socket-timeout".to_string(),
        "30".to_string(),
        "-o".to_string(),
        output_template,
    ];

    match job.mode {
        DownloadMode::Video => {
            args.push("-f".to_string());
            args.push(job.quality.video_selector().to_string());
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        DownloadMode::Audio => {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push("320K".to_string());
        }
    }

    args.push(job.url.clone());
    args
}

#[derive(Debug, Clone, PartialEq)]
enum OutputLine {
    Progress(EngineProgress),
    Artifact(String),
}

fn parse_output_line(line: &str) -> Option<OutputLine> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(OUTPUT_MARKER) {
        return non_na(rest).map(|path| OutputLine::Artifact(path.to_string()));
    }

    if let Some(rest) = line.strip_prefix(FORMAT_MARKER) {
        let streams = non_na(rest).map_or(1, |ids| ids.split('+').count());
        return Some(OutputLine::Progress(EngineProgress::Formats { streams }));
    }

    if line.starts_with(POSTPROCESS_MARKER) {
        return Some(OutputLine::Progress(EngineProgress::Processing {
            filename: None,
        }));
    }

    let rest = line.strip_prefix(PROGRESS_MARKER)?;
    let mut fields = rest.splitn(7, '|');
    let status = fields.next()?;
    let downloaded = fields.next().and_then(parse_number);
    let total = fields.next().and_then(parse_number);
    let estimate = fields.next().and_then(parse_number);
    let speed = fields.next().and_then(non_na).and_then(|v| v.parse::<f64>().ok());
    let eta = fields.next().and_then(parse_number);
    let filename = fields
        .next()
        .and_then(non_na)
        .and_then(|path| Path::new(path).file_name())
        .map(|name| name.to_string_lossy().into_owned());

    let event = match status {
        "finished" => EngineProgress::StreamFinished { filename },
        "downloading" => EngineProgress::Downloading {
            downloaded: downloaded.unwrap_or_default(),
            total: total.or(estimate).filter(|value| *value > 0),
            speed,
            eta,
            filename,
        },
        _ => return None,
    };

    Some(OutputLine::Progress(event))
}

fn non_na(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() || value == "NA" || value == "None" {
        None
    } else {
        Some(value)
    }
}

fn parse_number(value: &str) -> Option<u64> {
    let parsed = non_na(value)?.parse::<f64>().ok()?;
    (parsed.is_finite() && parsed >= 0.0).then(|| parsed.round() as u64)
}

fn run_error_message(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|line| line.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| "yt-dlp no pudo completar la operacion".to_string())
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    description: Option<String>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    ext: Option<String>,
    height: Option<u32>,
}

impl YtDlpVideoInfo {
    fn into_video_info(self) -> VideoInfo {
        let mut seen_heights = HashSet::new();
        let mut formats = self
            .formats
            .iter()
            .filter_map(|format| {
                let height = format.height.filter(|height| *height > 0)?;
                seen_heights.insert(height).then(|| HeightOption {
                    quality: format!("{height}p"),
                    height,
                    ext: format.ext.clone().unwrap_or_else(|| "mp4".to_string()),
                })
            })
            .collect::<Vec<_>>();
        formats.sort_by(|a, b| b.height.cmp(&a.height));
        formats.truncate(MAX_LISTED_HEIGHTS);

        VideoInfo {
            title: self
                .title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            duration: self.duration.unwrap_or_default(),
            thumbnail: self.thumbnail.unwrap_or_default(),
            uploader: self.uploader.unwrap_or_else(|| "Unknown".to_string()),
            description: self
                .description
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect(),
            view_count: self.view_count.unwrap_or_default(),
            formats,
        }
    }
}

/// Picks the finished file of a job: the path yt-dlp printed after moving it,
/// else whatever complete file the job directory holds. Anything resolving
/// outside the job directory is ignored.
async fn locate_artifact(job_dir: &Path, printed: Option<&str>) -> Result<PathBuf, EngineError> {
    let root = tokio::fs::canonicalize(job_dir)
        .await
        .map_err(|error| EngineError::Io(format!("carpeta de trabajo inaccesible: {error}")))?;

    let mut candidates = printed
        .map(|path| vec![PathBuf::from(path), job_dir.join(path)])
        .unwrap_or_default();
    candidates.extend(finished_files(job_dir).await?);

    for candidate in candidates {
        let Ok(resolved) = tokio::fs::canonicalize(&candidate).await else {
            continue;
        };
        if !resolved.starts_with(&root) {
            warn!("Archivo ignorado, queda fuera de {:?}: {:?}", root, resolved);
            continue;
        }
        if tokio::fs::metadata(&resolved)
            .await
            .is_ok_and(|metadata| metadata.is_file())
        {
            return Ok(resolved);
        }
    }

    Err(EngineError::InvalidOutput(
        "yt-dlp termino sin dejar ningun archivo".to_string(),
    ))
}

/// Entries of `job_dir` that are not partial downloads or hidden files.
async fn finished_files(job_dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let listing_error =
        |error: std::io::Error| EngineError::Io(format!("no se pudo listar {job_dir:?}: {error}"));
    let mut entries = tokio::fs::read_dir(job_dir).await.map_err(listing_error)?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(listing_error)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let partial = [".part", ".ytdl", ".temp"]
            .iter()
            .any(|suffix| name.ends_with(suffix));
        if !partial && !name.starts_with('.') {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
