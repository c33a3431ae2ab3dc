//! # kiln_chat - Requirements dialogue for kiln
//!
//! Turns a free-form conversation into confirmed requirements for an
//! application:
//! - Every user turn is classified once by an LLM (or any [`Classifier`])
//! - The decision moves the dialogue through gathering, clarifying and
//!   confirming until the user affirms the requirements
//! - Replies stream as [`kiln_core::ProgressEvent`]s; the conversation log and
//!   the sandbox task descriptor are written in the background
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌──────────────┐
//! │ ChatManager │────▶│ DialogueMachine  │────▶│  Classifier  │
//! └──────┬──────┘     └────────┬─────────┘     └──────────────┘
//!        │                     │
//!        ▼                     ▼
//! ┌──────────────┐     ┌──────────────────┐
//! │ Conversation │     │ ApplicationStore │
//! │    Store     │     │  + TaskQueue     │
//! └──────────────┘     └──────────────────┘
//! ```

pub mod classifier;
pub mod decision;
pub mod dialogue;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod persistence;
pub mod prompts;
pub mod session;
pub mod types;

pub use classifier::{Classifier, ScriptedClassifier};
pub use decision::{parse_decision, strip_fences, Action, Decision, ParsedDecision};
pub use dialogue::{DialogueMachine, DialogueState, Transition, FALLBACK_REPLY};
pub use error::{ChatError, ChatResult};
pub use jobs::{SaveReplyJob, TaskDescriptorJob};
pub use llm::{select_provider, LlmAdapter, LlmProvider};
pub use persistence::{ConversationStore, JsonlConversationStore, MemoryConversationStore};
pub use prompts::{classification_prompt, PromptContext};
pub use session::ChatManager;
pub use types::{next_turn, DialogueStage, Message, MessageRole};
