use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::{DownloadMode, Quality};

pub const HISTORY_RESPONSE_LIMIT: usize = 50;
const HISTORY_MAX_ENTRIES: usize = 2_000;

#[derive(Debug, Serialize, Clone)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub download_id: String,
    pub url: String,
    pub title: String,
    pub quality: Quality,
    pub format: DownloadMode,
    pub completed_at: DateTime<Utc>,
    pub filename: String,
}

/// Completed downloads, oldest first. Entries are never edited once pushed.
#[derive(Clone, Default)]
pub struct DownloadHistory {
    entries: Arc<Mutex<VecDeque<HistoryEntry>>>,
}

impl DownloadHistory {
    pub async fn push(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().await;
        entries.push_back(entry);
        while entries.len() > HISTORY_MAX_ENTRIES {
            entries.pop_front();
        }
    }

    /// The `limit` most recent entries, in completion order.
    pub async fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().await;
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            download_id: format!("download_{n}"),
            url: format!("https://vimeo.com/{n}"),
            title: format!("Clip {n}"),
            quality: Quality::Best,
            format: DownloadMode::Video,
            completed_at: Utc::now(),
            filename: format!("Clip {n}.mp4"),
        }
    }

    #[tokio::test]
    async fn recent_returns_the_tail_in_order() {
        let history = DownloadHistory::default();
        for n in 0..60 {
            history.push(entry(n)).await;
        }

        let recent = history.recent(HISTORY_RESPONSE_LIMIT).await;
        assert_eq!(recent.len(), 50);
        assert_eq!(recent.first().unwrap().download_id, "download_10");
        assert_eq!(recent.last().unwrap().download_id, "download_59");
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let history = DownloadHistory::default();
        for n in 0..HISTORY_MAX_ENTRIES + 5 {
            history.push(entry(n)).await;
        }

        let all = history.recent(usize::MAX).await;
        assert_eq!(all.len(), HISTORY_MAX_ENTRIES);
        assert_eq!(all[0].download_id, "download_5");
    }
}
