use thiserror::Error;

pub type Result<T> = std::result::Result<T, BatcherError>;

#[derive(Error, Debug)]
pub enum BatcherError {
    /// No usable credential record, or refresh client credentials missing.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Token expired and cannot be refreshed; credentials must be re-bootstrapped.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Transport failure, empty response, or an error reported by the portal.
    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BatcherError {
    /// Errors after which every further portal call would fail the same way.
    pub fn is_fatal_for_job(&self) -> bool {
        matches!(self, BatcherError::Configuration(_) | BatcherError::Auth(_))
    }
}

impl From<reqwest::Error> for BatcherError {
    fn from(err: reqwest::Error) -> Self {
        BatcherError::Remote(format!("HTTP request failed: {}", err))
    }
}
