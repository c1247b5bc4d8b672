//! Checks applied to user input before anything reaches the engine.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::LazyLock,
};

use regex_lite::Regex;
use url::{Host, Url};

use crate::{
    engine::{DownloadMode, Quality},
    tracker::SESSION_ID_PREFIX,
};

pub const MAX_URL_LENGTH: usize = 2048;
const MAX_DOWNLOAD_ID_LENGTH: usize = 50;

static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"<script[^>]*>.*?</script>",
        r"javascript:",
        r"\bon\w+\s*=",
        r"eval\s*\(",
        r"expression\s*\(",
        r"import\s+",
        r"exec\s*\(",
        r"<iframe",
        r"<embed",
        r"<object",
        r"\.\./\.\.",
        r"\.\.\\\.\.",
        r"union\s+select",
        r"drop\s+table",
        r"insert\s+into",
        r"delete\s+from",
        r"update\s+.*set",
        r"--\s*$",
        r"/\*.*\*/",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(&format!("(?i){pattern}")).ok())
    .collect()
});

const BLOCKED_HOSTS: [&str; 3] = ["localhost", "localhost.localdomain", "metadata.google.internal"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlRejection {
    Missing,
    TooLong,
    Suspicious,
    Malformed,
    Scheme,
    LocalHost,
    PrivateAddress,
    MetadataEndpoint,
}

impl UrlRejection {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Missing => "URL is required",
            Self::TooLong => "URL too long",
            Self::Suspicious => "URL contains suspicious content",
            Self::Malformed => "Invalid URL format",
            Self::Scheme => "Only http, https URLs are allowed",
            Self::LocalHost => "Local URLs are not allowed",
            Self::PrivateAddress => "Private IP addresses are not allowed",
            Self::MetadataEndpoint => "Metadata endpoints are not allowed",
        }
    }
}

pub fn validate_url(input: &str) -> Result<Url, UrlRejection> {
    let input = input.trim();
    if input.is_empty() {
        return Err(UrlRejection::Missing);
    }
    if input.len() > MAX_URL_LENGTH {
        return Err(UrlRejection::TooLong);
    }
    if BLOCKED_PATTERNS.iter().any(|pattern| pattern.is_match(input)) {
        return Err(UrlRejection::Suspicious);
    }

    let parsed = Url::parse(input).map_err(|_| UrlRejection::Malformed)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlRejection::Scheme);
    }

    match parsed.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "metadata.google.internal" {
                return Err(UrlRejection::MetadataEndpoint);
            }
            if BLOCKED_HOSTS.contains(&domain.as_str()) || domain.ends_with(".localhost") {
                return Err(UrlRejection::LocalHost);
            }
        }
        Some(Host::Ipv4(address)) => check_address(IpAddr::V4(address))?,
        Some(Host::Ipv6(address)) => check_address(IpAddr::V6(address))?,
        None => return Err(UrlRejection::Malformed),
    }

    Ok(parsed)
}

fn check_address(address: IpAddr) -> Result<(), UrlRejection> {
    if address == IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)) {
        return Err(UrlRejection::MetadataEndpoint);
    }
    if address.is_loopback() || address.is_unspecified() {
        return Err(UrlRejection::LocalHost);
    }

    let private = match address {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_broadcast(),
        IpAddr::V6(v6) => is_private_v6(v6),
    };
    if private {
        return Err(UrlRejection::PrivateAddress);
    }

    Ok(())
}

fn is_private_v6(address: Ipv6Addr) -> bool {
    if let Some(mapped) = address.to_ipv4_mapped() {
        return mapped.is_private() || mapped.is_loopback() || mapped.is_link_local();
    }
    let first = address.segments()[0];
    // fc00::/7 unique local, fe80::/10 link local
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Empty input falls back to `best`; anything else must be a known quality.
pub fn validate_quality(input: Option<&str>) -> Option<Quality> {
    match input.map(str::trim).filter(|value| !value.is_empty()) {
        None => Some(Quality::Best),
        Some(value) => Quality::parse(value),
    }
}

/// Empty input falls back to `video`.
pub fn validate_format(input: Option<&str>) -> Option<DownloadMode> {
    match input.map(str::trim).filter(|value| !value.is_empty()) {
        None => Some(DownloadMode::Video),
        Some(value) => DownloadMode::parse(value),
    }
}

pub fn sanitize_string(text: &str, max_length: usize) -> String {
    text.chars()
        .take(max_length)
        .filter(|character| !character.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Accepts only ids shaped like `download_<digits>`. Overlong ids are
/// refused outright, never truncated into a different id.
pub fn validate_download_id(raw: &str) -> Option<String> {
    if raw.trim().chars().count() > MAX_DOWNLOAD_ID_LENGTH {
        return None;
    }
    let id = sanitize_string(raw, MAX_DOWNLOAD_ID_LENGTH);
    let digits = id.strip_prefix(SESSION_ID_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_video_urls() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://vimeo.com/76979871",
            "http://www.tiktok.com/@user/video/123?content=1",
            "https://8.8.8.8/video.mp4",
        ] {
            assert!(validate_url(url).is_ok(), "{url} should be accepted");
        }
    }

    #[test]
    fn rejects_missing_and_oversized_urls() {
        assert_eq!(validate_url("   "), Err(UrlRejection::Missing));
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_LENGTH));
        assert_eq!(validate_url(&long), Err(UrlRejection::TooLong));
    }

    #[test]
    fn rejects_injection_patterns() {
        for url in [
            "https://example.com/<script>alert(1)</script>",
            "javascript:alert(1)",
            "https://example.com/?a=1 onload=steal()",
            "https://example.com/../../etc/passwd",
            "https://example.com/?q=1 UNION SELECT password",
        ] {
            assert_eq!(validate_url(url), Err(UrlRejection::Suspicious), "{url}");
        }
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(validate_url("ftp://example.com/file"), Err(UrlRejection::Scheme));
        assert_eq!(validate_url("file:///etc/passwd"), Err(UrlRejection::Scheme));
        assert_eq!(validate_url("not a url"), Err(UrlRejection::Malformed));
    }

    #[test]
    fn rejects_local_and_private_hosts() {
        assert_eq!(validate_url("http://localhost:8080/"), Err(UrlRejection::LocalHost));
        assert_eq!(validate_url("http://127.0.0.1/"), Err(UrlRejection::LocalHost));
        assert_eq!(validate_url("http://0.0.0.0/"), Err(UrlRejection::LocalHost));
        assert_eq!(validate_url("http://[::1]/"), Err(UrlRejection::LocalHost));
        assert_eq!(validate_url("http://192.168.1.10/"), Err(UrlRejection::PrivateAddress));
        assert_eq!(validate_url("http://10.0.0.1/"), Err(UrlRejection::PrivateAddress));
        assert_eq!(validate_url("http://172.16.5.4/"), Err(UrlRejection::PrivateAddress));
        assert_eq!(validate_url("http://[fd00::1]/"), Err(UrlRejection::PrivateAddress));
        assert_eq!(
            validate_url("http://169.254.169.254/latest/meta-data"),
            Err(UrlRejection::MetadataEndpoint)
        );
    }

    #[test]
    fn quality_and_format_defaults() {
        assert_eq!(validate_quality(None), Some(Quality::Best));
        assert_eq!(validate_quality(Some("")), Some(Quality::Best));
        assert_eq!(validate_quality(Some("720P")), Some(Quality::P720));
        assert_eq!(validate_quality(Some("potato")), None);

        assert_eq!(validate_format(None), Some(DownloadMode::Video));
        assert_eq!(validate_format(Some("audio")), Some(DownloadMode::Audio));
        assert_eq!(validate_format(Some("gif")), None);
    }

    #[test]
    fn download_ids_must_be_well_formed() {
        assert_eq!(
            validate_download_id("download_1734000000000"),
            Some("download_1734000000000".to_string())
        );
        assert_eq!(validate_download_id("download_"), None);
        assert_eq!(validate_download_id("download_12a"), None);
        assert_eq!(validate_download_id("../etc/passwd"), None);
        assert_eq!(validate_download_id(&format!("download_{}", "9".repeat(60))), None);

        let longest = format!("download_{}", "9".repeat(41));
        assert_eq!(validate_download_id(&longest), Some(longest.clone()));
        assert_eq!(validate_download_id(&format!("{longest}9")), None);
    }
}
