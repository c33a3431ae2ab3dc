//! Error types for templates.

use thiserror::Error;

/// Result type alias for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while rendering a project template.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Variable not provided: {0}")]
    MissingVariable(String),

    #[error("Template rendering failed for {file}: {message}")]
    RenderingFailed { file: String, message: String },
}
