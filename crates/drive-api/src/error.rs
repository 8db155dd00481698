//! Errors produced by the drive client.

use http::StatusCode;
use thiserror::Error;

/// Failure inside an [`crate::HttpClient`] backend, before any status code was seen.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The server could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Any other backend failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Everything that can go wrong talking to the drive.
#[derive(Debug, Error)]
pub enum DriveError {
    /// The transport failed.
    #[error("HTTP transport error")]
    Http(#[from] HttpClientError),

    /// The token endpoint refused the client credentials.
    #[error("authentication failed with HTTP {status}: {body}")]
    Auth {
        /// Status returned by the token endpoint.
        status: StatusCode,
        /// Raw response body, for diagnostics.
        body: String,
    },

    /// The requested object does not exist.
    #[error("object not found: {path}")]
    NotFound {
        /// Path that was requested.
        path: String,
    },

    /// Any non-success status outside of the cases above.
    #[error("drive returned HTTP {status}: {body}")]
    Status {
        /// Status returned by the drive.
        status: StatusCode,
        /// Raw response body, for diagnostics.
        body: String,
    },

    /// A success response whose body did not match the expected shape.
    #[error("malformed response body")]
    Decode(#[from] serde_json::Error),

    /// The configured base URL cannot be used to build request URLs.
    #[error("invalid base URL {url:?}")]
    InvalidBaseUrl {
        /// The offending URL.
        url: String,
    },
}

impl DriveError {
    /// The HTTP status behind this error, when there was one.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Auth { status, .. } | Self::Status { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Self::Http(_) | Self::Decode(_) | Self::InvalidBaseUrl { .. } => None,
        }
    }
}
