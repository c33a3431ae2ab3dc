//! Error types for the requirements dialogue.

use kiln_core::CoreError;
use thiserror::Error;

/// Chat errors
#[derive(Error, Debug)]
pub enum ChatError {
    /// The classification response held no usable decision. Recovered locally.
    #[error("Classification response was malformed: {0}")]
    ClassificationMalformed(String),

    #[error("LLM not configured. Set OPENAI_API_KEY or ANTHROPIC_API_KEY")]
    LlmNotConfigured,

    #[error("LLM error: {0}")]
    Llm(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Conversation storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ChatError> for CoreError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Core(inner) => inner,
            ChatError::Io(e) => CoreError::Io(e),
            other => CoreError::Storage(other.to_string()),
        }
    }
}

/// Result type for chat operations
pub type ChatResult<T> = Result<T, ChatError>;
