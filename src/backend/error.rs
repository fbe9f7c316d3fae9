use thiserror::Error;

/// A single failed call to a reasoning backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),

    #[error("backend misconfigured: {0}")]
    Config(String),
}

impl BackendError {
    /// Transport failures, throttling, server errors and malformed replies
    /// are worth another attempt; client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Malformed(_) => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Config(_) => false,
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            BackendError::Transport(_) => "transport_error",
            BackendError::Status { .. } => "http_error",
            BackendError::Malformed(_) => "malformed",
            BackendError::Config(_) => "config_error",
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Malformed(e.to_string())
    }
}

/// The adapter could not produce a decision
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("backend gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BackendError },

    #[error("backend error: {0}")]
    Fatal(BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retry_classification() {
        let status = |status| BackendError::Status {
            status,
            body: String::new(),
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(401).is_retryable());
        assert!(BackendError::Malformed("x".into()).is_retryable());
        assert!(!BackendError::Config("x".into()).is_retryable());
    }
}
