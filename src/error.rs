use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for operations in the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the SDK.
///
/// None of these errors ever reach the caller of a variation function: reads always degrade
/// to the caller's default value.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The authentication request was rejected, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// The token returned by the authentication call could not be decoded.
    #[error("invalid auth token: {0}")]
    InvalidToken(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// An operation that requires an authenticated session was called before `initialize()`
    /// succeeded.
    #[error("SDK not authenticated")]
    NotAuthenticated,

    /// The server answered with a non-success status code.
    #[error("server returned status {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or canonical reason.
        message: String,
    },

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Reading or decoding the push stream failed.
    #[error("stream error: {0}")]
    Stream(String),

    /// The push stream was silent for longer than the read timeout.
    #[error("stream read timed out")]
    StreamTimeout,

    /// The client was disposed while the operation was in flight.
    #[error("client disposed")]
    Disposed,
}

impl Error {
    /// HTTP status associated with the error, or 0 when the failure happened below HTTP.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Http { status, .. } => *status,
            Error::Unauthorized => 401,
            Error::Network(err) => err.status().map(|it| it.as_u16()).unwrap_or(0),
            _ => 0,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
