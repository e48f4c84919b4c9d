use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// An error that happens when loading an image from the network.
///
/// Errors are cheap to clone, so that one failed fetch can be reported to every caller waiting
/// on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The identifier is not a URL that can be fetched.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    /// The request did not produce a response, e.g. due to connection loss or DNS resolution.
    ///
    /// The attached string contains the cause chain.
    #[error("download failed: {0}")]
    Transport(String),
    /// The origin responded with a non-success status.
    #[error("unexpected status code: {0}")]
    Status(StatusCode),
    /// The origin responded successfully, but without any content.
    #[error("empty response body")]
    EmptyBody,
    /// The response body is not an image that can be decoded.
    #[error("response is not a valid image")]
    InvalidData,
    /// The response is not usable for the request that was made.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The fetch did not complete within the configured time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The load was cancelled by its owner.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the fetch machinery itself.
    #[error("internal error")]
    Internal,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return Self::InvalidUrl(err.to_string());
        }

        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Transport(message)
    }
}
