//! Error types for the core module.

use kiln_runner::RunnerError;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("{kind} not found: {id}")]
    EntityNotFound { kind: &'static str, id: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Step {step} failed: {message}")]
    PartialStepFailure { step: String, message: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(#[from] kiln_templates::TemplateError),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::EntityNotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }

    pub fn is_runtime_unavailable(&self) -> bool {
        matches!(self, Self::RuntimeUnavailable(_))
    }

    /// Short machine-readable code used in error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::EntityNotFound { .. } => "not_found",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::PartialStepFailure { .. } => "partial_step_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidState(_) => "invalid_state",
            Self::Sandbox(_) => "sandbox_error",
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => "storage_error",
            Self::Template(_) => "template_error",
            Self::Config(_) => "config_error",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

impl From<RunnerError> for CoreError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Unavailable(msg) => Self::RuntimeUnavailable(msg),
            RunnerError::NotFound(handle) => Self::not_found("Sandbox", handle),
            other => Self::Sandbox(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
