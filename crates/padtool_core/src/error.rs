use thiserror::Error;

/// Failure of an index build. Either variant discards the partial index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("link-usage API request to {url} failed: {reason}")]
    Api { url: String, reason: String },
    #[error("malformed link-usage API response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
}

impl IndexError {
    pub fn api(url: &str, reason: impl Into<String>) -> Self {
        Self::Api {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(url: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResponse { .. })
    }
}

/// Retryable subset of API failures: server errors, rate limiting, dropped connections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transient API failure: {reason}")]
pub struct TransientApiError {
    pub reason: String,
}

impl TransientApiError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn escalate(self, url: &str, attempts: usize) -> IndexError {
        IndexError::api(
            url,
            format!("gave up after {attempts} attempts: {}", self.reason),
        )
    }
}

/// Why a single pad could not be archived. Recorded in the error log, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP {status}")]
    Status { status: u16 },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("empty response body")]
    EmptyBody,
    #[error("no pad name in URL")]
    NoPadName,
    #[error("failed to write content file: {0}")]
    Write(String),
}
