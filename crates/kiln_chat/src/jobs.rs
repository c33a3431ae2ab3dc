//! Background jobs submitted by the dialogue and the chat manager.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{BackgroundJob, CoreResult, LifecycleManager};
use tracing::debug;

use crate::persistence::ConversationStore;
use crate::types::Message;

/// Writes the current requirements into the application's sandbox.
pub struct TaskDescriptorJob {
    lifecycle: Arc<LifecycleManager>,
    application_id: String,
    requirements: String,
}

impl TaskDescriptorJob {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        application_id: impl Into<String>,
        requirements: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            application_id: application_id.into(),
            requirements: requirements.into(),
        }
    }
}

#[async_trait]
impl BackgroundJob for TaskDescriptorJob {
    fn key(&self) -> String {
        format!("task-descriptor:{}", self.application_id)
    }

    async fn run(&self) -> CoreResult<()> {
        self.lifecycle
            .write_task_descriptor(&self.application_id, &self.requirements)
            .await
    }
}

/// Saves the assistant reply for one conversation turn, at most once.
pub struct SaveReplyJob {
    conversations: Arc<dyn ConversationStore>,
    application_id: String,
    turn: u32,
    content: String,
}

impl SaveReplyJob {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        application_id: impl Into<String>,
        turn: u32,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversations,
            application_id: application_id.into(),
            turn,
            content: content.into(),
        }
    }
}

#[async_trait]
impl BackgroundJob for SaveReplyJob {
    fn key(&self) -> String {
        format!("{}:{}", self.application_id, self.turn)
    }

    async fn run(&self) -> CoreResult<()> {
        let saved = self
            .conversations
            .append_reply(
                &self.application_id,
                Message::assistant(self.content.clone(), self.turn),
            )
            .await?;
        if !saved {
            debug!("Reply for {} already saved", self.key());
        }
        Ok(())
    }
}
