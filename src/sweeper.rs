//! Periodic reaper for expired sessions and leftover job directories.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::SessionTracker;

/// Owns the background sweep task. Dropping it leaves the task running; call
/// [`Sweeper::shutdown`] to stop it.
pub struct Sweeper {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(
        tracker: SessionTracker,
        download_dir: PathBuf,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_sweeps(
            tracker,
            download_dir,
            retention,
            interval,
            cancel.clone(),
        ));
        info!(
            "Limpieza automatica cada {}s (retencion {}s)",
            interval.as_secs(),
            retention.as_secs()
        );
        Self { cancel, task }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(error) = self.task.await {
            warn!("La tarea de limpieza termino con error: {error}");
        }
    }
}

async fn run_sweeps(
    tracker: SessionTracker,
    download_dir: PathBuf,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = tracker.sweep().await;
                debug!(
                    "Barrido de sesiones: {report:?}, {} sesion(es) activas",
                    tracker.len().await
                );
                cleanup_stale_download_jobs(&tracker, &download_dir, retention).await;
            }
        }
    }

    debug!("Tarea de limpieza detenida");
}

/// Removes entries under `download_dir` older than `max_age` that no live
/// session owns, such as job directories of failed downloads or of sessions
/// from a previous run.
async fn cleanup_stale_download_jobs(tracker: &SessionTracker, download_dir: &Path, max_age: Duration) {
    let mut entries = match tokio::fs::read_dir(download_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("No se pudo abrir la carpeta de descargas para limpieza: {error}");
            }
            return;
        }
    };

    let now = SystemTime::now();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("No se pudo iterar la carpeta de descargas: {error}");
                break;
            }
        };

        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|name| name.to_str())
            && tracker.get(name).await.is_some()
        {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("No se pudo leer metadata de {:?}: {error}", path);
                continue;
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let removal = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removal {
            Ok(()) => debug!("Restos eliminados: {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("No se pudo eliminar {:?}: {error}", path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{SessionStatus, SessionUpdate};

    #[tokio::test]
    async fn ticks_reap_expired_sessions_and_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SessionTracker::new(Duration::ZERO);

        let job_dir = dir.path().join("download_1");
        tokio::fs::create_dir_all(&job_dir).await.unwrap();
        let artifact = job_dir.join("clip.mp4");
        tokio::fs::write(&artifact, b"data").await.unwrap();

        let handle = tracker.create("download_1").await.unwrap();
        handle.update(SessionUpdate::completed(&artifact)).await;
        let orphan = dir.path().join("download_0");
        tokio::fs::create_dir_all(&orphan).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sweeper = Sweeper::spawn(
            tracker.clone(),
            dir.path().to_path_buf(),
            Duration::ZERO,
            Duration::from_millis(20),
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.len().await > 0 || orphan.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        sweeper.shutdown().await;

        assert!(tracker.get("download_1").await.is_none());
        assert!(!artifact.exists());
        assert!(!job_dir.exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn young_sessions_and_live_job_dirs_survive() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = SessionTracker::new(Duration::from_secs(3600));
        tracker.create("download_7").await.unwrap();
        tracker
            .update("download_7", SessionUpdate::status(SessionStatus::Downloading))
            .await;
        let live_dir = dir.path().join("download_7");
        tokio::fs::create_dir_all(&live_dir).await.unwrap();

        cleanup_stale_download_jobs(&tracker, dir.path(), Duration::ZERO).await;
        let report = tracker.sweep().await;

        assert_eq!(report.sessions_removed, 0);
        assert!(live_dir.exists());
    }

    #[tokio::test]
    async fn shutdown_stops_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = Sweeper::spawn(
            SessionTracker::new(Duration::from_secs(3600)),
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        tokio::time::timeout(Duration::from_secs(5), sweeper.shutdown())
            .await
            .unwrap();
    }
}
