//! Error taxonomy for proxy requests.
//!
//! Every failure raised while handling a request is classified into one of
//! four categories, each mapped onto a fixed HTTP status by the router:
//!
//! 1. **Unauthorized**: missing or wrong security token → 403.
//! 2. **Bad request**: malformed device id, missing target, unknown endpoint,
//!    missing/invalid `Content-Length`, absent session → 400.
//! 3. **ADB failure**: the device-bridge invocation failed or the OS could not
//!    launch it → 500 with the failure message.
//! 4. **Internal**: anything else → 500 with a generic diagnostic.
//!
//! Keep-alive expiry and cleanup timeouts are not errors. They are recorded on
//! the trace session and surfaced when the session is ended.

use poem::http::StatusCode;
use thiserror::Error;

/// Classified failure of a proxy request.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Security token missing or not matching
    #[error("Bad Winscope authorization token!")]
    Unauthorized,
    /// Invalid client request
    #[error("{0}")]
    BadRequest(String),
    /// Unsuccessful ADB operation
    #[error("{0}")]
    Adb(String),
    /// Unclassified failure
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn adb(message: impl Into<String>) -> Self {
        Self::Adb(message.into())
    }

    /// HTTP status the router answers with for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Adb(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err:?}"))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {err:?}"))
    }
}
