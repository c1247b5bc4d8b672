//! Background task that drives one download from `queued` to a terminal state.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    engine::{DownloadEngine, DownloadJob, DownloadMode, EngineProgress, Quality, describe_failure},
    history::{DownloadHistory, HistoryEntry},
    tracker::{
        DuplicateSession, SessionHandle, SessionStatus, SessionTracker, SessionUpdate,
        UpdateOutcome,
    },
};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub quality: Quality,
    pub mode: DownloadMode,
}

#[derive(Clone)]
pub struct DownloadWorker {
    engine: Arc<dyn DownloadEngine>,
    tracker: SessionTracker,
    history: DownloadHistory,
    permits: Arc<Semaphore>,
    download_dir: PathBuf,
}

impl DownloadWorker {
    pub fn new(
        engine: Arc<dyn DownloadEngine>,
        tracker: SessionTracker,
        history: DownloadHistory,
        permits: Arc<Semaphore>,
        download_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            tracker,
            history,
            permits,
            download_dir,
        }
    }

    /// Registers a new session and spawns the task that runs it. Returns the
    /// session id as soon as the record exists.
    pub async fn start(&self, request: DownloadRequest) -> Result<String, DuplicateSession> {
        let handle = self.tracker.create(self.tracker.next_id()).await?;
        handle
            .update(SessionUpdate {
                url: Some(request.url.clone()),
                quality: Some(request.quality),
                format: Some(request.mode),
                ..SessionUpdate::default()
            })
            .await;

        let id = handle.id().to_string();
        info!(
            "Descarga {id} en cola: {} ({}, {:?})",
            request.url,
            request.quality.as_str(),
            request.mode
        );

        let worker = self.clone();
        tokio::spawn(async move { worker.run(handle, request).await });

        Ok(id)
    }

    async fn run(self, handle: SessionHandle, request: DownloadRequest) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                handle
                    .update(SessionUpdate::failed("No se pudo reservar capacidad de descarga."))
                    .await;
                return;
            }
        };

        if handle.update(SessionUpdate::status(SessionStatus::Starting)).await
            != UpdateOutcome::Applied
        {
            debug!("Sesion {} ya no existe, se omite la descarga", handle.id());
            return;
        }

        let job_dir = self.download_dir.join(handle.id());
        if let Err(error) = tokio::fs::create_dir_all(&job_dir).await {
            warn!("No se pudo crear la carpeta {:?}: {error}", job_dir);
            handle
                .update(SessionUpdate::failed(format!(
                    "No se pudo preparar la descarga: {error}"
                )))
                .await;
            return;
        }

        let info = match self.engine.fetch_info(&request.url).await {
            Ok(info) => info,
            Err(error) => {
                warn!("Metadatos no disponibles para {}: {error}", handle.id());
                cleanup_download_job(&job_dir).await;
                handle
                    .update(SessionUpdate::failed(describe_failure(&error).message))
                    .await;
                return;
            }
        };
        handle
            .update(SessionUpdate {
                title: Some(info.title),
                thumbnail: Some(info.thumbnail),
                duration: Some(info.duration),
                uploader: Some(info.uploader),
                ..SessionUpdate::default()
            })
            .await;

        let job = DownloadJob {
            url: request.url.clone(),
            quality: request.quality,
            mode: request.mode,
            output_dir: job_dir.clone(),
        };
        let (sender, mut receiver) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let forward = async {
            let mut adapter = ProgressAdapter::default();
            while let Some(event) = receiver.recv().await {
                if let Some(update) = adapter.update_for(event) {
                    handle.update(update).await;
                }
            }
        };
        let (result, ()) = tokio::join!(self.engine.download(&job, sender), forward);

        match result {
            Ok(path) => self.finish(&handle, &request, &job_dir, path).await,
            Err(error) => {
                warn!("Descarga {} fallida: {error}", handle.id());
                cleanup_download_job(&job_dir).await;
                handle
                    .update(SessionUpdate::failed(describe_failure(&error).message))
                    .await;
            }
        }
    }

    async fn finish(
        &self,
        handle: &SessionHandle,
        request: &DownloadRequest,
        job_dir: &Path,
        path: PathBuf,
    ) {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download.bin".to_string());

        let outcome = handle
            .update(SessionUpdate {
                filename: Some(filename.clone()),
                ..SessionUpdate::completed(path)
            })
            .await;

        match outcome {
            UpdateOutcome::Applied => {
                let snapshot = handle.snapshot().await;
                let title = snapshot
                    .as_ref()
                    .and_then(|record| record.title.clone())
                    .unwrap_or_else(|| "Unknown".to_string());
                let completed_at = snapshot
                    .and_then(|record| record.completed_at)
                    .unwrap_or_else(Utc::now);

                self.history
                    .push(HistoryEntry {
                        id: Uuid::new_v4(),
                        download_id: handle.id().to_string(),
                        url: request.url.clone(),
                        title,
                        quality: request.quality,
                        format: request.mode,
                        completed_at,
                        filename: filename.clone(),
                    })
                    .await;
                info!("Descarga {} completada: {filename}", handle.id());
            }
            UpdateOutcome::Missing => {
                debug!(
                    "Sesion {} eliminada antes de terminar, se borra su carpeta",
                    handle.id()
                );
                cleanup_download_job(job_dir).await;
            }
            UpdateOutcome::Terminal | UpdateOutcome::Rejected => {
                warn!("No se pudo completar la sesion {}: {outcome:?}", handle.id());
            }
        }
    }
}

/// Turns engine events into tracker updates. The percentage covers every
/// stream of a merged download and never decreases, and once a postprocessor
/// runs the status stays `processing`.
#[derive(Debug)]
struct ProgressAdapter {
    streams: usize,
    finished_streams: usize,
    reported: f64,
    processing: bool,
}

impl Default for ProgressAdapter {
    fn default() -> Self {
        Self {
            streams: 1,
            finished_streams: 0,
            reported: 0.0,
            processing: false,
        }
    }
}

impl ProgressAdapter {
    fn update_for(&mut self, event: EngineProgress) -> Option<SessionUpdate> {
        let update = match event {
            EngineProgress::Formats { streams } => {
                self.streams = streams.max(1);
                return None;
            }
            _ if self.processing => SessionUpdate::status(SessionStatus::Processing),
            EngineProgress::Downloading {
                downloaded,
                total,
                speed,
                eta,
                filename,
            } => {
                if let Some(total) = total.filter(|total| *total > 0) {
                    let fraction = (downloaded as f64 / total as f64).clamp(0.0, 1.0);
                    self.advance(self.finished_streams as f64 + fraction);
                }
                SessionUpdate {
                    status: Some(SessionStatus::Downloading),
                    progress: Some(self.reported),
                    downloaded: Some(downloaded),
                    total,
                    speed,
                    eta,
                    filename,
                    ..SessionUpdate::default()
                }
            }
            EngineProgress::StreamFinished { filename } => {
                self.finished_streams += 1;
                self.advance(self.finished_streams as f64);
                SessionUpdate {
                    status: Some(SessionStatus::Downloading),
                    progress: Some(self.reported),
                    filename,
                    ..SessionUpdate::default()
                }
            }
            EngineProgress::Processing { filename } => {
                self.processing = true;
                self.reported = 100.0;
                SessionUpdate {
                    status: Some(SessionStatus::Processing),
                    progress: Some(100.0),
                    filename,
                    ..SessionUpdate::default()
                }
            }
        };
        Some(update)
    }

    /// `streams_done` counts whole streams, fractional for the one in flight.
    fn advance(&mut self, streams_done: f64) {
        // yt-dlp may write more streams than the format id announced
        self.streams = self.streams.max(streams_done.ceil() as usize);
        let percent = (streams_done / self.streams as f64 * 100.0).clamp(0.0, 100.0);
        self.reported = self.reported.max(percent);
    }
}

pub async fn cleanup_download_job(job_dir: &Path) {
    if let Err(error) = tokio::fs::remove_dir_all(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        info!("No se pudo limpiar la carpeta de trabajo: {error}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        engine::{EngineError, VideoInfo},
        tracker::SessionRecord,
    };

    /// Scripted engine: replays `events`, then writes `artifact` into the job
    /// directory or fails with `failure`.
    pub(crate) struct FakeEngine {
        pub info: Result<VideoInfo, EngineError>,
        pub events: Vec<EngineProgress>,
        pub artifact: &'static str,
        pub failure: Option<EngineError>,
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeEngine {
        pub(crate) fn succeeding() -> Self {
            Self {
                info: Ok(sample_info()),
                events: vec![
                    EngineProgress::Formats { streams: 1 },
                    EngineProgress::Downloading {
                        downloaded: 50,
                        total: Some(100),
                        speed: Some(10.0),
                        eta: Some(5),
                        filename: Some("Sample Clip.f137.mp4".to_string()),
                    },
                    EngineProgress::StreamFinished {
                        filename: Some("Sample Clip.f137.mp4".to_string()),
                    },
                    EngineProgress::Processing { filename: None },
                ],
                artifact: "Sample Clip.mp4",
                failure: None,
                gate: None,
            }
        }
    }

    pub(crate) fn sample_info() -> VideoInfo {
        VideoInfo {
            title: "Sample Clip".to_string(),
            duration: 42.0,
            thumbnail: "https://i.example.com/thumb.jpg".to_string(),
            uploader: "someone".to_string(),
            description: "A short clip".to_string(),
            view_count: 7,
            formats: Vec::new(),
        }
    }

    #[async_trait]
    impl DownloadEngine for FakeEngine {
        async fn fetch_info(&self, _url: &str) -> Result<VideoInfo, EngineError> {
            self.info.clone()
        }

        async fn download(
            &self,
            job: &DownloadJob,
            progress: mpsc::Sender<EngineProgress>,
        ) -> Result<PathBuf, EngineError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            for event in &self.events {
                let _ = progress.send(event.clone()).await;
            }
            if let Some(error) = &self.failure {
                return Err(error.clone());
            }
            let path = job.output_dir.join(self.artifact);
            tokio::fs::write(&path, b"video bytes")
                .await
                .map_err(|error| EngineError::Io(error.to_string()))?;
            Ok(path)
        }
    }

    struct Harness {
        worker: DownloadWorker,
        tracker: SessionTracker,
        history: DownloadHistory,
        permits: Arc<Semaphore>,
        dir: tempfile::TempDir,
    }

    fn harness(engine: FakeEngine, permits: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SessionTracker::new(Duration::from_secs(3600));
        let history = DownloadHistory::default();
        let permits = Arc::new(Semaphore::new(permits));
        let worker = DownloadWorker::new(
            Arc::new(engine),
            tracker.clone(),
            history.clone(),
            Arc::clone(&permits),
            dir.path().to_path_buf(),
        );
        Harness {
            worker,
            tracker,
            history,
            permits,
            dir,
        }
    }

    fn request() -> DownloadRequest {
        DownloadRequest {
            url: "https://vimeo.com/76979871".to_string(),
            quality: Quality::P720,
            mode: DownloadMode::Video,
        }
    }

    pub(crate) async fn wait_for_terminal(tracker: &SessionTracker, id: &str) -> SessionRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = tracker.get(id).await
                    && record.status.is_terminal()
                {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached a terminal state")
    }

    #[tokio::test]
    async fn successful_download_completes_and_lands_in_history() {
        let h = harness(FakeEngine::succeeding(), 1);
        let id = h.worker.start(request()).await.unwrap();

        let record = wait_for_terminal(&h.tracker, &id).await;
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.progress, 100.0);
        assert_eq!(record.title.as_deref(), Some("Sample Clip"));
        assert_eq!(record.uploader.as_deref(), Some("someone"));
        assert_eq!(record.filename.as_deref(), Some("Sample Clip.mp4"));
        assert_eq!(record.quality, Some(Quality::P720));
        assert!(record.completed_at.is_some());
        assert!(record.error.is_none());

        let path = record.file_path.unwrap();
        assert!(path.starts_with(h.dir.path().join(&id)));
        assert!(tokio::fs::metadata(&path).await.unwrap().is_file());

        let history = h.history.recent(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].download_id, id);
        assert_eq!(history[0].title, "Sample Clip");
        assert_eq!(history[0].filename, "Sample Clip.mp4");
    }

    #[tokio::test]
    async fn engine_failure_ends_in_error_with_friendly_message() {
        let engine = FakeEngine {
            failure: Some(EngineError::Failed(
                "[vimeo] 1: HTTP Error 404: Not Found".to_string(),
            )),
            ..FakeEngine::succeeding()
        };
        let h = harness(engine, 1);
        let id = h.worker.start(request()).await.unwrap();

        let record = wait_for_terminal(&h.tracker, &id).await;
        assert_eq!(record.status, SessionStatus::Error);
        assert!(record.error.unwrap().contains("404"));
        assert!(record.file_path.is_none());
        assert!(h.history.recent(10).await.is_empty());
        assert!(!h.dir.path().join(&id).exists());
    }

    #[tokio::test]
    async fn metadata_failure_ends_in_error() {
        let engine = FakeEngine {
            info: Err(EngineError::Failed("This video is DRM protected".to_string())),
            ..FakeEngine::succeeding()
        };
        let h = harness(engine, 1);
        let id = h.worker.start(request()).await.unwrap();

        let record = wait_for_terminal(&h.tracker, &id).await;
        assert_eq!(record.status, SessionStatus::Error);
        assert!(record.error.unwrap().contains("DRM"));
    }

    #[tokio::test]
    async fn stays_queued_until_a_permit_frees_up() {
        let h = harness(FakeEngine::succeeding(), 0);
        let id = h.worker.start(request()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = h.tracker.get(&id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Queued);
        assert_eq!(record.url.as_deref(), Some("https://vimeo.com/76979871"));

        h.permits.add_permits(1);
        let record = wait_for_terminal(&h.tracker, &id).await;
        assert_eq!(record.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn status_stays_starting_until_the_engine_reports() {
        let gate = Arc::new(Notify::new());
        let engine = FakeEngine {
            gate: Some(Arc::clone(&gate)),
            ..FakeEngine::succeeding()
        };
        let h = harness(engine, 1);
        let id = h.worker.start(request()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.tracker.get(&id).await.and_then(|r| r.title).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let record = h.tracker.get(&id).await.unwrap();
        assert_eq!(record.status, SessionStatus::Starting);

        gate.notify_one();
        let record = wait_for_terminal(&h.tracker, &id).await;
        assert_eq!(record.status, SessionStatus::Completed);
    }

    fn downloading(downloaded: u64, total: Option<u64>, filename: &str) -> EngineProgress {
        EngineProgress::Downloading {
            downloaded,
            total,
            speed: None,
            eta: None,
            filename: Some(filename.to_string()),
        }
    }

    fn finished(filename: &str) -> EngineProgress {
        EngineProgress::StreamFinished {
            filename: Some(filename.to_string()),
        }
    }

    fn phase(status: SessionStatus) -> u8 {
        match status {
            SessionStatus::Queued => 0,
            SessionStatus::Starting => 1,
            SessionStatus::Downloading => 2,
            SessionStatus::Processing => 3,
            SessionStatus::Completed | SessionStatus::Error => 4,
        }
    }

    #[test]
    fn progress_never_moves_backwards_between_files() {
        let mut adapter = ProgressAdapter::default();
        let mut progress = |event: EngineProgress| {
            adapter
                .update_for(event)
                .and_then(|update| update.progress)
        };

        assert_eq!(progress(downloading(40, Some(100), "a.f137.mp4")), Some(40.0));
        assert_eq!(progress(downloading(10, Some(100), "a.f137.mp4")), Some(40.0));
        assert_eq!(progress(downloading(90, Some(100), "a.f137.mp4")), Some(90.0));
        assert_eq!(progress(downloading(5, None, "a.f137.mp4")), Some(90.0));
        assert_eq!(progress(finished("a.f137.mp4")), Some(100.0));
        // an unannounced second stream restarts its own byte counter
        assert_eq!(progress(downloading(20, Some(100), "a.f140.m4a")), Some(100.0));
    }

    #[tokio::test]
    async fn merged_download_status_never_moves_backwards() {
        let tracker = SessionTracker::new(Duration::from_secs(3600));
        let handle = tracker.create("download_1").await.unwrap();
        handle.update(SessionUpdate::status(SessionStatus::Starting)).await;

        let events = vec![
            EngineProgress::Formats { streams: 2 },
            downloading(50, Some(100), "clip.f137.mp4"),
            finished("clip.f137.mp4"),
            downloading(50, Some(100), "clip.f140.m4a"),
            finished("clip.f140.m4a"),
            EngineProgress::Processing { filename: None },
            downloading(1, Some(100), "clip.f140.m4a"),
        ];

        let mut adapter = ProgressAdapter::default();
        let mut seen = Vec::new();
        for event in events {
            if let Some(update) = adapter.update_for(event) {
                handle.update(update).await;
            }
            let record = handle.snapshot().await.unwrap();
            seen.push((record.status, record.progress));
        }

        assert_eq!(
            seen,
            vec![
                (SessionStatus::Starting, 0.0),
                (SessionStatus::Downloading, 25.0),
                (SessionStatus::Downloading, 50.0),
                (SessionStatus::Downloading, 75.0),
                (SessionStatus::Downloading, 100.0),
                (SessionStatus::Processing, 100.0),
                (SessionStatus::Processing, 100.0),
            ]
        );
        assert!(seen.windows(2).all(|pair| phase(pair[0].0) <= phase(pair[1].0)));
        assert!(seen.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    }
}
