use serde::{Deserialize, Serialize};

/// Sentinel codes for failures that have no HTTP status. HTTP failures
/// carry their status code directly, so everything internal stays negative.
pub mod codes {
    pub const ABORTED: i32 = -1;
    pub const FAILURE: i32 = -2;
    pub const BANDWIDTH: i32 = -3;
    pub const INVALID_RANGE: i32 = -4;
    pub const NODE_NOT_FOUND: i32 = -5;
    pub const NOT_SUPPORTED: i32 = -6;

    pub const BAD_REQUEST: i32 = 400;
    pub const UNAUTHORIZED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const NOT_FOUND: i32 = 404;
    pub const RANGE_NOT_SATISFIABLE: i32 = 416;
    pub const TOO_MANY_REQUESTS: i32 = 429;
    pub const INTERNAL: i32 = 500;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
}

/// Stable descriptions used across providers. The numeric code is the
/// contract; these strings are human-readable and not localized.
pub mod messages {
    pub const ABORTED: &str = "aborted";
    pub const INVALID_CREDENTIALS: &str = "invalid credentials";
    pub const INVALID_AUTHORIZATION_CODE: &str = "invalid authorization code";
    pub const NODE_NOT_FOUND: &str = "node not found";
    pub const INVALID_RANGE: &str = "invalid range";
}

/// Coarse failure taxonomy derived from the code. Used by consumers that
/// branch on the class of failure rather than the exact code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Http,
    Auth,
    Semantic,
    Resource,
    Cancelled,
    Internal,
}

/// The unified error value. Never thrown; every boundary returns it inside
/// a `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{description} (code {code})")]
pub struct Error {
    pub code: i32,
    pub description: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(codes::ABORTED, messages::ABORTED)
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Self::new(codes::FAILURE, description)
    }

    pub fn not_found(description: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, description)
    }

    pub fn node_not_found() -> Self {
        Self::new(codes::NODE_NOT_FOUND, messages::NODE_NOT_FOUND)
    }

    pub fn unauthorized() -> Self {
        Self::new(codes::UNAUTHORIZED, messages::INVALID_CREDENTIALS)
    }

    pub fn invalid_authorization_code() -> Self {
        Self::new(codes::BAD_REQUEST, messages::INVALID_AUTHORIZATION_CODE)
    }

    pub fn invalid_range() -> Self {
        Self::new(codes::INVALID_RANGE, messages::INVALID_RANGE)
    }

    pub fn invalid_argument(description: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, description)
    }

    pub fn forbidden(description: impl Into<String>) -> Self {
        Self::new(codes::FORBIDDEN, description)
    }

    pub fn not_supported(operation: &str) -> Self {
        Self::new(codes::NOT_SUPPORTED, format!("{operation} not supported"))
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, description)
    }

    /// Transport-level failure (connect, TLS, DNS, broken stream).
    pub fn transport(description: impl Into<String>) -> Self {
        Self::new(codes::FAILURE, description)
    }

    pub fn http(code: u16, description: impl Into<String>) -> Self {
        Self::new(i32::from(code), description)
    }

    pub fn kind(&self) -> ErrorKind {
        match self.code {
            codes::ABORTED => ErrorKind::Cancelled,
            codes::UNAUTHORIZED | codes::FORBIDDEN => ErrorKind::Auth,
            codes::TOO_MANY_REQUESTS | codes::BANDWIDTH => ErrorKind::Resource,
            codes::NODE_NOT_FOUND | codes::NOT_FOUND => ErrorKind::Semantic,
            codes::BAD_REQUEST | codes::INVALID_RANGE | codes::RANGE_NOT_SATISFIABLE => {
                ErrorKind::Semantic
            }
            codes::NOT_SUPPORTED => ErrorKind::Semantic,
            codes::FAILURE => ErrorKind::Transport,
            c if c >= 500 => ErrorKind::Http,
            c if c > 0 => ErrorKind::Http,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.code == codes::ABORTED
    }

    /// Whether the engine may retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            codes::TOO_MANY_REQUESTS | codes::BANDWIDTH | 500 | 502 | 503 | 504
        )
    }

    /// Whether the failure should trigger one reauthorization attempt.
    pub fn needs_reauth(&self) -> bool {
        self.code == codes::UNAUTHORIZED
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::http(status.as_u16(), e.to_string()),
            None => Error::transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::failure(format!("invalid response body: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::internal(e.to_string())
    }
}
