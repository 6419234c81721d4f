//! Common error types for tillsync.

use thiserror::Error;

/// Top-level error type for tillsync operations.
///
/// Network-facing variants are typed by cause so callers can decide between
/// retrying, resolving a conflict, or surfacing the failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Local storage is unavailable or a statement failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found locally.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No attempt was made because the environment reports offline.
    #[error("Offline: no network connectivity")]
    Offline,

    /// The request did not complete within its deadline or was cancelled.
    #[error("Request timed out")]
    Timeout,

    /// The circuit breaker is open; the server is presumed degraded.
    #[error("Service degraded: circuit breaker is open")]
    CircuitOpen,

    /// The host could not be reached, or the request was blocked by policy.
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// True when the failure was caused by a network policy (e.g. a
        /// cross-origin block) rather than by the server.
        blocked: bool,
    },

    /// 4xx response other than 409.
    #[error("HTTP {status}: {message}")]
    HttpClient {
        status: u16,
        message: String,
        /// Domain rejection code from the response body, if any.
        code: Option<String>,
    },

    /// 5xx response.
    #[error("HTTP {status}: {message}")]
    HttpServer { status: u16, message: String },

    /// 409 response: the server considers the write stale or a duplicate.
    #[error("Conflict: {message}")]
    Conflict {
        message: String,
        code: Option<String>,
    },

    /// Attempts exhausted or a business rule rejected the work.
    #[error("Terminal failure: {0}")]
    TerminalFailure(String),
}

impl Error {
    /// Build an error from a non-success HTTP status and the server's message.
    pub fn from_status(status: u16, message: impl Into<String>, code: Option<String>) -> Self {
        let message = message.into();
        match status {
            409 => Error::Conflict { message, code },
            400..=499 => Error::HttpClient {
                status,
                message,
                code,
            },
            _ => Error::HttpServer { status, message },
        }
    }

    /// Convenience constructor for unreachable-host errors.
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
            blocked: false,
        }
    }

    /// HTTP status carried by this error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::HttpClient { status, .. } | Error::HttpServer { status, .. } => Some(*status),
            Error::Conflict { .. } => Some(409),
            _ => None,
        }
    }

    /// Domain rejection code carried in the error body, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::HttpClient { code, .. } | Error::Conflict { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether this failure says something about the server's health.
    ///
    /// Only 5xx responses and timeouts count; policy blocks never do.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Error::HttpServer { .. } | Error::Timeout)
    }

    /// Whether a later attempt might succeed without any change on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout | Error::HttpServer { .. } => true,
            Error::Network { blocked, .. } => !blocked,
            Error::HttpClient { status, .. } => matches!(status, 408 | 429),
            _ => false,
        }
    }

    /// The server's own message for response errors, the display form otherwise.
    pub fn message(&self) -> String {
        match self {
            Error::HttpClient { message, .. }
            | Error::HttpServer { message, .. }
            | Error::Conflict { message, .. }
            | Error::Network { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True for 4xx responses, including 409.
    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(400..=499))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
