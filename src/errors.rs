use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Closed taxonomy of failure kinds. Adapters classify from the HTTP and
/// network level, the router and services re-tag, the transport renders
/// the user-facing envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    RateLimit,
    LimitExceeded,
    Overloaded,
    ServerError,
    SslError,
    AuthError,
    InvalidRequest,
    InvalidResponse,
    ProviderUnavailable,
    CircuitOpen,
    UnsupportedCapability,
    QualityCheckFailed,
    IdentificationError,
    EnrichmentError,
    ClarificationError,
    DatabaseError,
    RetryExhausted,
    UnknownError,
}

impl ErrorKind {
    /// Kinds worth retrying. Everything else fails the attempt outright.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Overloaded
                | ErrorKind::SslError
        )
    }

    /// Wire name used in SSE `error` events and JSON envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::LimitExceeded => "limit_exceeded",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::SslError => "ssl_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::UnsupportedCapability => "unsupported_capability",
            ErrorKind::QualityCheckFailed => "quality_check_failed",
            ErrorKind::IdentificationError => "identification_error",
            ErrorKind::EnrichmentError => "enrichment_error",
            ErrorKind::ClarificationError => "clarification_error",
            ErrorKind::DatabaseError => "database_error",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::UnknownError => "unknown_error",
        }
    }

    /// Classify an upstream HTTP status plus response text.
    pub fn from_status(status: u16, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        match status {
            429 => ErrorKind::RateLimit,
            503 => ErrorKind::Overloaded,
            408 => ErrorKind::Timeout,
            401 => ErrorKind::AuthError,
            400 => ErrorKind::InvalidRequest,
            s if s >= 500 => ErrorKind::ServerError,
            _ if lower.contains("timeout") || lower.contains("timed out") => ErrorKind::Timeout,
            _ => ErrorKind::UnknownError,
        }
    }

    /// Classify a reqwest transport failure (no HTTP status available).
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            let text = err.to_string().to_ascii_lowercase();
            if text.contains("ssl") || text.contains("tls") || text.contains("certificate") {
                ErrorKind::SslError
            } else {
                ErrorKind::ProviderUnavailable
            }
        } else {
            ErrorKind::UnknownError
        }
    }

    /// Short sentence shown to the end user, in the sommelier's voice.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "The cellar took too long to answer. Please try again.",
            ErrorKind::RateLimit => "Too many tastings at once. Give it a moment and retry.",
            ErrorKind::LimitExceeded => {
                "You've reached today's tasting limit. Come back tomorrow."
            }
            ErrorKind::Overloaded => "The sommelier is swamped right now. Try again shortly.",
            ErrorKind::ServerError => "Something went wrong behind the bar. Please retry.",
            ErrorKind::SslError => "We couldn't open a secure line to the cellar.",
            ErrorKind::AuthError => "The cellar door is locked on our side. We're on it.",
            ErrorKind::InvalidRequest => "That request didn't make sense to the sommelier.",
            ErrorKind::InvalidResponse => "The sommelier's notes came back illegible. Please retry.",
            ErrorKind::ProviderUnavailable => "The cellar is unreachable at the moment.",
            ErrorKind::CircuitOpen => {
                "We're resting this cellar after repeated trouble. Try again soon."
            }
            ErrorKind::UnsupportedCapability => "That cellar can't handle this kind of request.",
            ErrorKind::IdentificationError => "We couldn't make out this wine. Try a clearer photo.",
            ErrorKind::EnrichmentError => "We couldn't pull the tasting notes for this wine.",
            ErrorKind::ClarificationError => "We couldn't work out which option you meant.",
            ErrorKind::QualityCheckFailed => "The identification didn't pass our quality bar.",
            ErrorKind::DatabaseError => "Our cellar book is unavailable right now.",
            ErrorKind::RetryExhausted => "We tried a few times and couldn't get an answer.",
            ErrorKind::UnknownError => "Something unexpected happened. Please try again.",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::RateLimit | ErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::QualityCheckFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::SslError => StatusCode::BAD_GATEWAY,
            ErrorKind::Overloaded | ErrorKind::CircuitOpen | ErrorKind::ProviderUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::InvalidRequest
            | ErrorKind::ClarificationError
            | ErrorKind::UnsupportedCapability => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub message: String,
    pub support_ref: Option<String>,
}

impl AgentError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            support_ref: None,
        }
    }

    /// Attach a correlation ref derived from time + kind + endpoint so
    /// user reports can be matched back to logs.
    pub fn with_support_ref(mut self, endpoint: &str) -> Self {
        self.support_ref = Some(support_ref(self.kind, endpoint));
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<sqlx::Error> for AgentError {
    fn from(e: sqlx::Error) -> Self {
        AgentError::new(ErrorKind::DatabaseError, e.to_string())
    }
}

/// 8-hex correlation ref for user-facing errors.
pub fn support_ref(kind: ErrorKind, endpoint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chrono::Utc::now().timestamp_micros().to_le_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(endpoint.as_bytes());
    hex::encode(&hasher.finalize()[..4])
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();

        if status.is_server_error() {
            tracing::error!(
                kind = %self.kind,
                support_ref = self.support_ref.as_deref().unwrap_or("-"),
                "{}",
                self.message
            );
        }

        let body = Json(json!({
            "success": false,
            "message": self.message,
            "error": {
                "type": self.kind.as_str(),
                "userMessage": self.kind.user_message(),
                "retryable": self.kind.is_retryable(),
                "supportRef": self.support_ref,
            }
        }));

        let mut response = (status, body).into_response();

        if matches!(self.kind, ErrorKind::RateLimit | ErrorKind::LimitExceeded) {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("60"));
        }

        response
    }
}
