//! Chat manager.
//!
//! Entry point for conversation turns: records the user message, runs the
//! dialogue and forwards its events, then saves the assistant reply in the
//! background once the stream has finished. Once requirements are confirmed
//! nothing more is written to the log.

use std::sync::Arc;

use kiln_core::{AssistantTranscript, CoreError, ProgressEvent, ProgressStream, TaskQueue};
use tracing::{debug, info};

use crate::dialogue::DialogueMachine;
use crate::error::ChatResult;
use crate::jobs::SaveReplyJob;
use crate::persistence::ConversationStore;
use crate::types::{next_turn, Message};

/// Coordinates the conversation log, the dialogue and background saves.
pub struct ChatManager {
    dialogue: DialogueMachine,
    conversations: Arc<dyn ConversationStore>,
    outbox: Arc<TaskQueue>,
}

impl ChatManager {
    pub fn new(
        dialogue: DialogueMachine,
        conversations: Arc<dyn ConversationStore>,
        outbox: Arc<TaskQueue>,
    ) -> Self {
        Self {
            dialogue,
            conversations,
            outbox,
        }
    }

    /// Full conversation log for an application.
    pub async fn history(&self, application_id: &str) -> ChatResult<Vec<Message>> {
        self.conversations.load(application_id).await
    }

    /// Send a user message and stream the dialogue's response.
    pub async fn send_message(
        &self,
        application_id: &str,
        user_id: &str,
        text: &str,
    ) -> ChatResult<ProgressStream> {
        if !self.dialogue.accepts_turns(application_id).await? {
            // Confirmed applications take no more turns; keep the log as it is
            debug!("Not logging message for confirmed application {}", application_id);
            return Ok(self
                .dialogue
                .advance(application_id, user_id, text, Vec::new()));
        }

        let prior = self.conversations.load(application_id).await?;
        let turn = next_turn(&prior);
        self.conversations
            .append(application_id, Message::user(text, turn))
            .await?;
        info!("Turn {} for application {}", turn, application_id);

        let mut inner = self
            .dialogue
            .advance(application_id, user_id, text, prior);
        let conversations = self.conversations.clone();
        let outbox = self.outbox.clone();
        let application_id = application_id.to_string();

        Ok(ProgressStream::spawn(move |mut emitter| async move {
            let mut transcript = AssistantTranscript::new();

            while let Some(event) = inner.next_event().await {
                if event.is_terminal() {
                    if transcript.is_empty() {
                        debug!("No assistant text to save for {}:{}", application_id, turn);
                    } else {
                        outbox.submit(SaveReplyJob::new(
                            conversations.clone(),
                            application_id.clone(),
                            turn,
                            transcript.text(),
                        ));
                    }
                    break;
                }
                if let ProgressEvent::Text { content } = &event {
                    transcript.observe(content);
                }
                emitter.emit(event).await?;
            }
            Ok::<(), CoreError>(())
        }))
    }

    /// Wait for queued background saves.
    pub async fn flush(&self) {
        self.outbox.flush().await;
    }
}
