//! Fetch Error Types
//!
//! Network-level failures only. A response with a non-success status is
//! still a response and is returned as such.

/// Fetch failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Request error: {0}")]
    Request(String),
}

impl FetchError {
    /// Classify a reqwest error
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_connect() || err.is_body() {
            FetchError::Network(err.to_string())
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::Request(err.to_string())
        }
    }
}
