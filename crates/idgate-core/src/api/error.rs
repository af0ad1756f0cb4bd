use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The refresh failed or the credential was rejected for good.
    /// Raised only after the local session has been torn down.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Server error ({status}): {message}")]
    TransientServer { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    ClientRequest { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// The server's `message` field when the body is a JSON error object,
    /// otherwise the (truncated) body itself.
    fn server_message(body: &str) -> String {
        serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .map(|m| Self::truncate_body(&m))
            .unwrap_or_else(|| Self::truncate_body(body))
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let message = Self::server_message(body);
        match status.as_u16() {
            code @ 500..=599 => ApiError::TransientServer { status: code, message },
            code @ 400..=499 => ApiError::ClientRequest { status: code, message },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// Failures worth retrying with backoff: 5xx, timeouts and lost connections
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::TransientServer { .. } | ApiError::Timeout | ApiError::Network(_)
        )
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ApiError::AuthenticationFailure(_))
    }
}
