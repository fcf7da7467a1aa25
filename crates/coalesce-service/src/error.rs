use std::time::Duration;

use thiserror::Error;

/// The reason an operation did not produce a value.
///
/// Errors are fanned out to every observer of a [`Future`](crate::promise::Future), which is
/// why they carry owned strings instead of the underlying error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The operation failed at the I/O level, like connection loss, DNS resolution, or a
    /// non-successful server response.
    ///
    /// The attached string contains the transport's description of the problem.
    #[error("transport error: {0}")]
    Transport(String),
    /// The payload was fetched successfully, but could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The operation did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// A required input is absent, for example no URL is configured, or the remote
    /// resource does not exist.
    #[error("missing resource: {0}")]
    MissingResource(String),
    /// A [`Promise`](crate::promise::Promise) was settled a second time.
    ///
    /// This is programmer misuse. The outcome of the first settlement stays in place.
    #[error("promise already settled")]
    AlreadySettled,
    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
    /// The [`Promise`](crate::promise::Promise) was dropped without ever being settled.
    #[error("promise dropped without being settled")]
    Abandoned,
}

impl FetchError {
    /// A short name of the error kind, for use as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
            Self::MissingResource(_) => "missing",
            Self::AlreadySettled => "already_settled",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    #[track_caller]
    fn from(err: reqwest::Error) -> Self {
        tracing::debug!(error = &err as &dyn std::error::Error, "Request failed");
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// The settled state of an operation: either `Ok(V)` or the reason it failed.
pub type Outcome<V> = Result<V, FetchError>;
