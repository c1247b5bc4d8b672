//! In-memory registry of download sessions.
//!
//! Every download started through the API owns exactly one [`SessionRecord`]
//! here. The worker driving the engine writes into it with
//! [`SessionTracker::update`], pollers read snapshots with
//! [`SessionTracker::get`], and the sweeper reaps records (and the files they
//! point to) once they outlive the retention window.
//!
//! All operations go through a single map-wide lock, so a reader always sees
//! a record either before or after a merge, never halfway through one.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::engine::{DownloadMode, Quality};

pub const SESSION_ID_PREFIX: &str = "download_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Queued,
    Starting,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: SessionStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<Quality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<DownloadMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    /// Absolute path on this host; never sent to clients.
    #[serde(skip_serializing)]
    pub file_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    fn new(id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SessionStatus::Queued,
            progress: 0.0,
            downloaded: None,
            total: None,
            speed: None,
            eta: None,
            title: None,
            filename: None,
            url: None,
            quality: None,
            format: None,
            thumbnail: None,
            duration: None,
            uploader: None,
            file_path: None,
            error: None,
            created_at,
            completed_at: None,
        }
    }
}

/// Partial set of fields merged into a record by [`SessionTracker::update`].
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub progress: Option<f64>,
    pub downloaded: Option<u64>,
    pub total: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub title: Option<String>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub quality: Option<Quality>,
    pub format: Option<DownloadMode>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed(file_path: impl Into<PathBuf>) -> Self {
        Self {
            status: Some(SessionStatus::Completed),
            progress: Some(100.0),
            file_path: Some(file_path.into()),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The record already reached `completed` or `error`.
    Terminal,
    /// Unknown id, or the record was already swept.
    Missing,
    /// Would have completed the session without an artifact.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSession(pub String);

impl std::fmt::Display for DuplicateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "la sesion de descarga {} ya existe", self.0)
    }
}

impl std::error::Error for DuplicateSession {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_removed: usize,
    pub files_removed: usize,
    pub failures: usize,
}

#[derive(Clone)]
pub struct SessionTracker {
    sessions: Arc<Mutex<HashMap<String, SessionRecord>>>,
    last_id_millis: Arc<AtomicI64>,
    retention: chrono::Duration,
}

impl SessionTracker {
    pub fn new(retention: Duration) -> Self {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or(chrono::TimeDelta::MAX);
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            last_id_millis: Arc::new(AtomicI64::new(0)),
            retention,
        }
    }

    /// Produces `download_<millis>`, bumped past the last issued value so two
    /// requests within the same millisecond still get distinct ids.
    pub fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_id_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_id_millis.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{SESSION_ID_PREFIX}{candidate}"),
                Err(current) => last = current,
            }
        }
    }

    pub async fn create(&self, id: impl Into<String>) -> Result<SessionHandle, DuplicateSession> {
        let id = id.into();
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            error!("Se intento crear una sesion duplicada: {id}");
            return Err(DuplicateSession(id));
        }

        sessions.insert(id.clone(), SessionRecord::new(id.clone(), Utc::now()));
        debug!("Sesion {id} creada");

        Ok(SessionHandle {
            id,
            tracker: self.clone(),
        })
    }

    pub async fn update(&self, id: &str, update: SessionUpdate) -> UpdateOutcome {
        let mut sessions = self.sessions.lock().await;
        let Some(record) = sessions.get_mut(id) else {
            debug!("Actualizacion ignorada para sesion inexistente {id}");
            return UpdateOutcome::Missing;
        };

        let outcome = apply_update(record, update, Utc::now());
        if outcome == UpdateOutcome::Rejected {
            warn!("Actualizacion rechazada para {id}: completado sin archivo");
        }
        outcome
    }

    pub async fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Removes every record created more than the retention window before
    /// `now`, then deletes the artifacts they pointed to.
    ///
    /// Records leave the map before their files are touched, so a concurrent
    /// `get` never hands out a path whose file is already gone.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return SweepReport::default();
        };
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let expired_ids = sessions
                .iter()
                .filter(|(_, record)| record.created_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect::<Vec<_>>();
            expired_ids
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect::<Vec<_>>()
        };

        let mut report = SweepReport {
            sessions_removed: expired.len(),
            ..SweepReport::default()
        };

        for record in expired {
            let Some(path) = record.file_path.as_deref() else {
                continue;
            };
            match remove_artifact(path, &record.id).await {
                Ok(true) => report.files_removed += 1,
                Ok(false) => {}
                Err(error) => {
                    report.failures += 1;
                    warn!(
                        "No se pudo eliminar el archivo {:?} de la sesion {}: {error}",
                        path, record.id
                    );
                }
            }
        }

        if report.sessions_removed > 0 {
            info!(
                "Limpieza completada: {} sesion(es), {} archivo(s), {} fallo(s)",
                report.sessions_removed, report.files_removed, report.failures
            );
        }

        report
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, id: &str, created_at: DateTime<Utc>) {
        if let Some(record) = self.sessions.lock().await.get_mut(id) {
            record.created_at = created_at;
        }
    }
}

/// Non-owning reference to one session, held by the worker that drives it.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tracker: SessionTracker,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn update(&self, update: SessionUpdate) -> UpdateOutcome {
        self.tracker.update(&self.id, update).await
    }

    pub async fn snapshot(&self) -> Option<SessionRecord> {
        self.tracker.get(&self.id).await
    }
}

fn apply_update(
    record: &mut SessionRecord,
    update: SessionUpdate,
    now: DateTime<Utc>,
) -> UpdateOutcome {
    if record.status.is_terminal() {
        return UpdateOutcome::Terminal;
    }

    let status = update.status.unwrap_or(record.status);
    if status == SessionStatus::Completed
        && update.file_path.is_none()
        && record.file_path.is_none()
    {
        return UpdateOutcome::Rejected;
    }

    if let Some(progress) = update.progress {
        record.progress = progress.clamp(0.0, 100.0);
    }
    merge(&mut record.downloaded, update.downloaded);
    merge(&mut record.total, update.total);
    merge(&mut record.speed, update.speed);
    merge(&mut record.eta, update.eta);
    merge(&mut record.title, update.title);
    merge(&mut record.filename, update.filename);
    merge(&mut record.url, update.url);
    merge(&mut record.quality, update.quality);
    merge(&mut record.format, update.format);
    merge(&mut record.thumbnail, update.thumbnail);
    merge(&mut record.duration, update.duration);
    merge(&mut record.uploader, update.uploader);
    merge(&mut record.file_path, update.file_path);
    merge(&mut record.error, update.error);
    record.status = status;

    if status != SessionStatus::Downloading {
        record.downloaded = None;
        record.total = None;
        record.speed = None;
        record.eta = None;
    }

    match status {
        SessionStatus::Completed => {
            record.error = None;
            record.completed_at = Some(now);
        }
        SessionStatus::Error => {
            record.file_path = None;
            if record.error.is_none() {
                record.error = Some("Error desconocido".to_string());
            }
        }
        _ => {
            record.file_path = None;
            record.error = None;
        }
    }

    UpdateOutcome::Applied
}

fn merge<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// Deletes an expired artifact and, when it lives in the session's own job
/// directory, that directory too if nothing else is left in it.
async fn remove_artifact(path: &Path, session_id: &str) -> std::io::Result<bool> {
    let removed = match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => return Err(error),
    };

    if let Some(job_dir) = path.parent()
        && job_dir.file_name().and_then(|name| name.to_str()) == Some(session_id)
        && let Err(error) = tokio::fs::remove_dir(job_dir).await
        && error.kind() != ErrorKind::NotFound
    {
        debug!("Carpeta de trabajo {:?} no eliminada: {error}", job_dir);
    }

    Ok(removed)
}
