//! Error taxonomy for session operations
//!
//! Every variant knows its boundary status code and whether the retry loop
//! may try again with another credential.

/// Errors surfaced by a `Session` and the pieces it drives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller sent a structurally invalid request. Never retried.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Upstream rejected the bound credential (401/403).
    #[error("upstream rejected credential ({status}): {message}")]
    Auth { status: u16, message: String },

    /// Upstream returned 429.
    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    /// 5xx, network failure, malformed upstream reply, or mid-stream error.
    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    /// No usable credential left in the pool.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Anything unexpected, including out-of-order session calls.
    #[error("server error: {0}")]
    Server(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream {
            status: None,
            message: message.into(),
        }
    }

    /// HTTP status to report to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth { .. } => 401,
            Error::RateLimited(_) => 429,
            Error::Upstream { status, .. } => status.filter(|s| *s >= 500).unwrap_or(502),
            Error::PoolExhausted(_) => 503,
            Error::Server(_) => 500,
        }
    }

    /// Whether another attempt (possibly with another credential) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Auth { .. } | Error::RateLimited(_) | Error::Upstream { .. }
        )
    }

    /// Whether the bound credential should be quarantined.
    pub fn is_credential_fault(&self) -> bool {
        matches!(self, Error::Auth { .. })
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Auth { .. } => "auth",
            Error::RateLimited(_) => "rate_limited",
            Error::Upstream { .. } => "upstream",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::Server(_) => "server",
        }
    }
}

impl From<token_pool::Error> for Error {
    fn from(err: token_pool::Error) -> Self {
        match err {
            token_pool::Error::PoolExhausted(msg) => Error::PoolExhausted(msg),
            other => Error::Server(other.to_string()),
        }
    }
}

/// Longest upstream body excerpt kept in an error message.
const BODY_EXCERPT_CHARS: usize = 512;

/// Map a non-success upstream response to an error.
///
/// 401/403 mean the credential is unusable, 429 is rate limiting, everything
/// else (5xx, unexpected 4xx) is a generic upstream failure.
pub fn classify_status(status: u16, body: &str) -> Error {
    let excerpt: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
    match status {
        401 | 403 => Error::Auth {
            status,
            message: excerpt,
        },
        429 => Error::RateLimited(excerpt),
        _ => Error::Upstream {
            status: Some(status),
            message: format!("upstream returned {status}: {excerpt}"),
        },
    }
}
