//! Error types for the runtime client.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors that can occur while talking to the sandbox engine.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Sandbox engine unavailable: {0}")]
    Unavailable(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Image pull failed: {0}")]
    ImagePullFailed(String),

    #[error("Image pull for {image} timed out after {seconds} seconds")]
    PullTimeout { image: String, seconds: u64 },

    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether the engine itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the handle refers to an environment the engine no longer knows.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Classify a Docker API error against the handle it concerned.
    pub(crate) fn from_docker(err: bollard::errors::Error, subject: &str) -> Self {
        use bollard::errors::Error;

        match err {
            Error::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound(subject.to_string()),
            Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::Engine(format!("{} ({}): {}", subject, status_code, message)),
            Error::IOError { err } => Self::Unavailable(err.to_string()),
            Error::HyperResponseError { err } => Self::Unavailable(err.to_string()),
            Error::RequestTimeoutError => Self::Unavailable("request timed out".to_string()),
            other => Self::Engine(other.to_string()),
        }
    }
}
