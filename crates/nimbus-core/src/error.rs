//! Error types for nimbus.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// An equivalent job is already active. Callers skip, they do not fail.
    #[error("job in progress: {0}")]
    JobInProgress(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("credential error: {0}")]
    Credential(String),

    /// Malformed parameters or unknown references. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the next scheduling tick may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Throttled(_) | Error::Transport(_) | Error::Timeout(_) | Error::Store(_)
        )
    }

    /// Short categorical code recorded on failed jobs.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::InvalidInput(_) => "InvalidInput",
            Error::Conflict(_) => "Conflict",
            Error::JobInProgress(_) => "JobInProgress",
            Error::Throttled(_) => "Throttled",
            Error::Transport(_) => "Transport",
            Error::Credential(_) => "Credential",
            Error::Configuration(_) => "Configuration",
            Error::Timeout(_) => "Timeout",
            Error::Store(_) => "Store",
            Error::Internal(_) => "Internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Throttled("429".into()).is_retryable());
        assert!(Error::Transport("reset".into()).is_retryable());
        assert!(!Error::Configuration("bad params".into()).is_retryable());
        assert!(!Error::JobInProgress("busy".into()).is_retryable());
    }
}
