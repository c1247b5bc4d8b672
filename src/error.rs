use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub suggestion: Option<String>,
    pub details: Option<String>,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            suggestion: None,
            details: None,
            code: None,
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn request_too_large() -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, "Request too large")
            .with_suggestion("The request payload is too large")
    }

    pub fn download_not_found() -> Self {
        Self::not_found("Download not found").with_code("DOWNLOAD_NOT_FOUND")
    }

    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self {
            code: Some("RATE_LIMIT_EXCEEDED"),
            retry_after_seconds: Some(retry_after_seconds),
            ..Self::new(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded")
                .with_suggestion("Please wait a moment before trying again")
                .with_details("Too many requests. Please slow down.")
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            suggestion: self.suggestion,
            details: self.details,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let response = ApiError::rate_limited(42).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("42")
        );
    }

    #[test]
    fn canned_client_errors_read_in_english_throughout() {
        let too_large = ApiError::request_too_large();
        assert_eq!(too_large.message, "Request too large");
        assert_eq!(too_large.suggestion.as_deref(), Some("The request payload is too large"));

        let limited = ApiError::rate_limited(5);
        assert_eq!(limited.message, "Rate limit exceeded");
        assert_eq!(
            limited.suggestion.as_deref(),
            Some("Please wait a moment before trying again")
        );
        assert_eq!(limited.details.as_deref(), Some("Too many requests. Please slow down."));
    }

    #[test]
    fn builders_fill_optional_fields() {
        let error = ApiError::bad_request("Invalid URL")
            .with_suggestion("Use http or https")
            .with_details("ftp://example.com");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.suggestion.as_deref(), Some("Use http or https"));
        assert_eq!(error.details.as_deref(), Some("ftp://example.com"));
        assert!(error.code.is_none());
    }
}
