//! Conversation messages and dialogue stages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Assistant,
    User,
}

/// A single conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (UUID)
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// User turn this message belongs to; a reply shares its prompt's turn
    #[serde(default)]
    pub turn: u32,
}

impl Message {
    fn with_role(role: MessageRole, content: impl Into<String>, turn: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            turn,
        }
    }

    /// Create a new user message
    pub fn user(content: impl Into<String>, turn: u32) -> Self {
        Self::with_role(MessageRole::User, content, turn)
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>, turn: u32) -> Self {
        Self::with_role(MessageRole::Assistant, content, turn)
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, content, 0)
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }
}

/// Where the requirements conversation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DialogueStage {
    #[default]
    Gathering,
    Clarifying,
    Confirming,
    /// Terminal for the dialogue; generation is a caller decision
    Confirmed,
}

impl DialogueStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gathering => "gathering",
            Self::Clarifying => "clarifying",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for DialogueStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Number of the next user turn given a conversation log.
pub fn next_turn(messages: &[Message]) -> u32 {
    messages.iter().map(|m| m.turn).max().unwrap_or(0) + 1
}
