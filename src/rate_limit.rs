use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

const WINDOW_SECONDS: i64 = 60;
const MAX_TRACKED_KEYS: usize = 20_000;

type RateLimitMap = HashMap<String, Vec<DateTime<Utc>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteBucket {
    Download,
    Progress,
    Info,
    History,
    Downloads,
    SupportedSites,
    File,
}

impl RouteBucket {
    /// Maps a matched route template to its bucket. Unlisted routes are not limited.
    pub fn from_route(path: &str) -> Option<Self> {
        match path {
            "/api/download" => Some(Self::Download),
            "/api/progress/{download_id}" => Some(Self::Progress),
            "/api/info" => Some(Self::Info),
            "/api/history" => Some(Self::History),
            "/api/downloads" => Some(Self::Downloads),
            "/api/supported-sites" => Some(Self::SupportedSites),
            "/api/file/{download_id}" => Some(Self::File),
            _ => None,
        }
    }

    pub fn per_minute(self) -> usize {
        match self {
            Self::Download | Self::SupportedSites => 10,
            Self::Info | Self::Downloads | Self::File => 20,
            Self::History => 30,
            Self::Progress => 60,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Progress => "progress",
            Self::Info => "info",
            Self::History => "history",
            Self::Downloads => "downloads",
            Self::SupportedSites => "supported-sites",
            Self::File => "file",
        }
    }
}

/// Sliding one-minute window per client IP and route.
#[derive(Clone, Default)]
pub struct RateLimiter {
    hits: Arc<Mutex<RateLimitMap>>,
}

impl RateLimiter {
    /// Records a hit, or returns the seconds until the oldest hit in the
    /// window expires when the bucket is full.
    pub async fn check(
        &self,
        ip: &str,
        bucket: RouteBucket,
        now: DateTime<Utc>,
    ) -> Result<(), u64> {
        let window = chrono::Duration::seconds(WINDOW_SECONDS);
        let window_start = now - window;
        let key = format!("{}:{ip}", bucket.as_str());

        let mut hits = self.hits.lock().await;
        if hits.len() > MAX_TRACKED_KEYS {
            hits.retain(|_, timestamps| {
                timestamps.retain(|timestamp| *timestamp > window_start);
                !timestamps.is_empty()
            });
        }

        let entries = hits.entry(key).or_default();
        entries.retain(|timestamp| *timestamp > window_start);

        if entries.len() >= bucket.per_minute() {
            let reset_at = entries.first().map_or(now + window, |oldest| *oldest + window);
            let retry_after = (reset_at - now).num_seconds().max(1) as u64;
            debug!(
                "Limite alcanzado para {ip} en {}: reintento en {retry_after}s",
                bucket.as_str()
            );
            return Err(retry_after);
        }

        entries.push(now);
        Ok(())
    }
}
