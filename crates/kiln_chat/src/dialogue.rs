//! Requirements dialogue state machine.
//!
//! Each user turn is classified once and moves the dialogue between
//! `gathering`, `clarifying`, `confirming` and `confirmed`. The state is
//! rebuilt every turn from the application's persisted requirements and the
//! message history; nothing else is stored.

use std::sync::Arc;

use kiln_core::{
    ApplicationStatus, ApplicationUpdate, CoreError, CoreResult, EventEmitter, LifecycleManager,
    ProgressEvent, ProgressStream, TaskQueue,
};
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::decision::{parse_decision, Action, Decision};
use crate::error::ChatError;
use crate::jobs::TaskDescriptorJob;
use crate::prompts::{classification_prompt, PromptContext};
use crate::types::{next_turn, DialogueStage, Message, MessageRole};

/// Reply used when the classifier produced nothing to show.
pub const FALLBACK_REPLY: &str =
    "Could you tell me a bit more about the application you would like to build?";

const CONFIRMED_MESSAGE: &str = "Requirements confirmed. Code generation can start now.";

/// Dialogue state for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueState {
    pub messages: Vec<Message>,
    pub requirements: Option<String>,
    pub confirmed: bool,
    pub clarifying_questions: Vec<String>,
    pub stage: DialogueStage,
}

/// What a decision changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Action actually taken
    pub action: Action,
    pub stage: DialogueStage,
    pub reply: String,
    /// Requirements text to persist, when it changed this turn
    pub requirements_updated: Option<String>,
    /// Whether this turn confirmed the requirements
    pub confirmed: bool,
}

impl DialogueState {
    /// Rebuild the state from persisted fields and the message log.
    pub fn restore(requirements: Option<&str>, confirmed: bool, messages: Vec<Message>) -> Self {
        let requirements = requirements
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let pending_question = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .filter(|m| m.content.trim_end().ends_with('?'))
            .map(|m| m.content.trim().to_string());

        let (stage, clarifying_questions) = if confirmed {
            (DialogueStage::Confirmed, Vec::new())
        } else if requirements.is_some() {
            (DialogueStage::Confirming, Vec::new())
        } else if let Some(question) = pending_question {
            (DialogueStage::Clarifying, vec![question])
        } else {
            (DialogueStage::Gathering, Vec::new())
        };

        Self {
            messages,
            requirements,
            confirmed,
            clarifying_questions,
            stage,
        }
    }

    pub fn prompt_context(&self) -> PromptContext<'_> {
        PromptContext {
            requirements: self.requirements.as_deref(),
            pending_question: self.clarifying_questions.first().map(String::as_str),
        }
    }

    /// Apply one decision and append the reply to the message log.
    pub fn apply(&mut self, decision: Decision, turn: u32) -> Transition {
        let Decision {
            mut action,
            response,
            requirements,
            mut clarifying_questions,
        } = decision;

        let mut requirements_updated = None;
        let mut confirmed = false;

        if action == Action::StartGen && requirements.is_none() && self.requirements.is_none() {
            debug!("start_gen without requirements; continuing instead");
            action = Action::Continue;
        }

        let reply = match action {
            Action::Clarify => {
                clarifying_questions.truncate(1);
                let reply = if response.is_empty() {
                    clarifying_questions
                        .first()
                        .cloned()
                        .unwrap_or_else(|| FALLBACK_REPLY.to_string())
                } else {
                    response
                };
                self.clarifying_questions = clarifying_questions;
                self.stage = DialogueStage::Clarifying;
                reply
            }
            Action::Extract => {
                if let Some(requirements) = requirements {
                    self.requirements = Some(requirements.clone());
                    requirements_updated = Some(requirements);
                }
                self.clarifying_questions.clear();
                self.stage = DialogueStage::Confirming;
                non_empty_or_fallback(response)
            }
            Action::StartGen => {
                if let Some(requirements) = requirements {
                    if self.requirements.as_deref() != Some(requirements.as_str()) {
                        requirements_updated = Some(requirements.clone());
                    }
                    self.requirements = Some(requirements);
                }
                self.confirmed = true;
                confirmed = true;
                self.clarifying_questions.clear();
                self.stage = DialogueStage::Confirmed;
                non_empty_or_fallback_to(response, CONFIRMED_MESSAGE)
            }
            Action::Continue => {
                self.stage = DialogueStage::Gathering;
                non_empty_or_fallback(response)
            }
        };

        self.messages.push(Message::assistant(reply.clone(), turn));

        Transition {
            action,
            stage: self.stage,
            reply,
            requirements_updated,
            confirmed,
        }
    }
}

fn non_empty_or_fallback(response: String) -> String {
    non_empty_or_fallback_to(response, FALLBACK_REPLY)
}

fn non_empty_or_fallback_to(response: String, fallback: &str) -> String {
    if response.trim().is_empty() {
        fallback.to_string()
    } else {
        response
    }
}

/// Runs dialogue turns for applications.
#[derive(Clone)]
pub struct DialogueMachine {
    classifier: Arc<dyn Classifier>,
    lifecycle: Arc<LifecycleManager>,
    outbox: Arc<TaskQueue>,
}

impl DialogueMachine {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        lifecycle: Arc<LifecycleManager>,
        outbox: Arc<TaskQueue>,
    ) -> Self {
        Self {
            classifier,
            lifecycle,
            outbox,
        }
    }

    /// Whether the application still takes dialogue turns.
    ///
    /// Unknown applications count as open so the turn itself reports them.
    pub async fn accepts_turns(&self, application_id: &str) -> CoreResult<bool> {
        match self.lifecycle.application(application_id).await {
            Ok(app) => Ok(!app.requirements_confirmed),
            Err(CoreError::EntityNotFound { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Process one user turn.
    ///
    /// `prior_messages` is the history before `user_text`. An application
    /// whose requirements are already confirmed yields only the terminal
    /// marker and is not classified again.
    pub fn advance(
        &self,
        application_id: &str,
        user_id: &str,
        user_text: &str,
        prior_messages: Vec<Message>,
    ) -> ProgressStream {
        let machine = self.clone();
        let application_id = application_id.to_string();
        let user_id = user_id.to_string();
        let user_text = user_text.to_string();

        ProgressStream::spawn(move |mut emitter| async move {
            machine
                .run_turn(&application_id, &user_id, &user_text, prior_messages, &mut emitter)
                .await
        })
    }

    async fn run_turn(
        &self,
        application_id: &str,
        user_id: &str,
        user_text: &str,
        prior_messages: Vec<Message>,
        emitter: &mut EventEmitter,
    ) -> CoreResult<()> {
        let app = self.lifecycle.application(application_id).await?;
        if app.owner_id != user_id {
            return Err(CoreError::not_found("Application", application_id));
        }
        if app.requirements_confirmed {
            info!("Requirements for {} already confirmed; nothing to do", application_id);
            return Ok(());
        }

        let turn = next_turn(&prior_messages);
        let mut messages = prior_messages;
        messages.push(Message::user(user_text, turn));
        let mut state = DialogueState::restore(app.requirements_text(), false, messages);
        let mut cursor = state.messages.len();
        debug!(
            "Dialogue for {} resumed at stage {} (turn {})",
            application_id, state.stage, turn
        );

        emitter.thought("Processing your message...").await?;

        let prompt = classification_prompt(&state.prompt_context());
        let raw = match self.classifier.classify(&prompt, &state.messages).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Classifier failed for {}: {}", application_id, e);
                FALLBACK_REPLY.to_string()
            }
        };

        let parsed = parse_decision(&raw);
        if parsed.is_malformed() {
            let preview: String = raw.chars().take(120).collect();
            warn!("{}", ChatError::ClassificationMalformed(preview));
        }

        let transition = state.apply(parsed.into_decision(), turn);
        info!(
            "Dialogue for {}: action {} -> stage {}",
            application_id, transition.action, transition.stage
        );
        emit_new_replies(&state.messages, &mut cursor, emitter).await?;

        if transition.requirements_updated.is_some() || transition.confirmed {
            self.persist(application_id, &state, &transition).await?;
        }

        if transition.confirmed {
            emitter
                .emit(ProgressEvent::RequirementsConfirmed {
                    requirements: state.requirements.clone().unwrap_or_default(),
                    message: CONFIRMED_MESSAGE.to_string(),
                })
                .await?;
        }

        // Safety net for replies appended after the first pass
        emit_new_replies(&state.messages, &mut cursor, emitter).await?;
        Ok(())
    }

    async fn persist(
        &self,
        application_id: &str,
        state: &DialogueState,
        transition: &Transition,
    ) -> CoreResult<()> {
        let Some(requirements) = state.requirements.clone() else {
            return Ok(());
        };

        let mut update = ApplicationUpdate::new().requirements(requirements.clone());
        if transition.confirmed {
            update = update.confirmed(true);
            let app = self.lifecycle.application(application_id).await?;
            if app
                .status
                .can_transition_to(ApplicationStatus::RequirementsConfirmed)
            {
                update = update.status(ApplicationStatus::RequirementsConfirmed);
            }
        }
        self.lifecycle
            .applications()
            .update_application(application_id, update)
            .await?
            .ok_or_else(|| CoreError::not_found("Application", application_id))?;
        info!(
            "Saved requirements for {} ({} chars, confirmed: {})",
            application_id,
            requirements.len(),
            transition.confirmed
        );

        self.outbox.submit(TaskDescriptorJob::new(
            self.lifecycle.clone(),
            application_id,
            requirements,
        ));
        Ok(())
    }
}

/// Emit assistant messages past `cursor`, skipping text already sent.
async fn emit_new_replies(
    messages: &[Message],
    cursor: &mut usize,
    emitter: &mut EventEmitter,
) -> CoreResult<()> {
    for message in messages.iter().skip(*cursor) {
        if message.is_assistant() && !emitter.has_emitted_text(&message.content) {
            emitter.text(message.content.clone()).await?;
        }
    }
    *cursor = messages.len();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::MockClassifier;
    use kiln_core::{Application, ApplicationStore, MemoryStore, SandboxSettings};
    use kiln_runner::MockRuntime;

    fn decision(action: Action, response: &str, requirements: Option<&str>) -> Decision {
        Decision {
            action,
            response: response.to_string(),
            requirements: requirements.map(str::to_string),
            clarifying_questions: Vec::new(),
        }
    }

    #[test]
    fn test_restore_stages() {
        assert_eq!(
            DialogueState::restore(None, false, Vec::new()).stage,
            DialogueStage::Gathering
        );
        assert_eq!(
            DialogueState::restore(Some("A blog"), false, Vec::new()).stage,
            DialogueStage::Confirming
        );
        assert_eq!(
            DialogueState::restore(Some("A blog"), true, Vec::new()).stage,
            DialogueStage::Confirmed
        );

        let asked = vec![
            Message::user("I want an app", 1),
            Message::assistant("Who will use it?", 1),
        ];
        let state = DialogueState::restore(Some("  "), false, asked);
        assert_eq!(state.stage, DialogueStage::Clarifying);
        assert_eq!(state.clarifying_questions, vec!["Who will use it?"]);
    }

    #[test]
    fn test_clarify_keeps_one_question() {
        let mut state = DialogueState::restore(None, false, Vec::new());
        let transition = state.apply(
            Decision {
                action: Action::Clarify,
                response: String::new(),
                requirements: None,
                clarifying_questions: vec!["Who uses it?".into(), "What colour?".into()],
            },
            1,
        );

        assert_eq!(transition.stage, DialogueStage::Clarifying);
        assert_eq!(transition.reply, "Who uses it?");
        assert_eq!(state.clarifying_questions.len(), 1);
    }

    #[test]
    fn test_extract_records_requirements() {
        let mut state = DialogueState::restore(None, false, Vec::new());
        let transition = state.apply(
            decision(Action::Extract, "Shall I build it?", Some("A blog with tags")),
            1,
        );

        assert_eq!(transition.stage, DialogueStage::Confirming);
        assert_eq!(transition.requirements_updated.as_deref(), Some("A blog with tags"));
        assert!(!transition.confirmed);
        assert_eq!(state.messages.last().unwrap().content, "Shall I build it?");
    }

    #[test]
    fn test_start_gen_without_requirements_continues() {
        let mut state = DialogueState::restore(None, false, Vec::new());
        let transition = state.apply(decision(Action::StartGen, "Starting!", None), 1);

        assert_eq!(transition.action, Action::Continue);
        assert_eq!(transition.stage, DialogueStage::Gathering);
        assert!(!state.confirmed);
    }

    #[test]
    fn test_start_gen_may_revise_requirements() {
        let mut state = DialogueState::restore(Some("A blog"), false, Vec::new());
        let transition = state.apply(
            decision(Action::StartGen, "Building now.", Some("A blog with comments")),
            2,
        );

        assert!(transition.confirmed);
        assert_eq!(transition.stage, DialogueStage::Confirmed);
        assert_eq!(
            transition.requirements_updated.as_deref(),
            Some("A blog with comments")
        );
    }

    #[test]
    fn test_prose_moves_to_gathering() {
        let mut state = DialogueState::restore(None, false, vec![Message::user("hi", 1)]);
        let prose = "Hello! What would you like to build today?";
        let transition = state.apply(parse_decision(prose).into_decision(), 1);

        assert_eq!(transition.stage, DialogueStage::Gathering);
        assert_eq!(transition.reply, prose);
    }

    #[tokio::test]
    async fn test_confirmed_application_skips_classifier() {
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().times(0);

        let store = Arc::new(MemoryStore::new());
        let mut app = Application::new("owner-1", "Blog");
        app.requirements = Some("A blog".to_string());
        app.requirements_confirmed = true;
        let app = store.insert_application(app).await.unwrap();

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(MockRuntime::new()),
            store.clone(),
            store.clone(),
            SandboxSettings::default(),
        ));
        let machine = DialogueMachine::new(
            Arc::new(classifier),
            lifecycle,
            Arc::new(TaskQueue::start()),
        );

        let events = machine
            .advance(&app.id, "owner-1", "also add dark mode", Vec::new())
            .collect_events()
            .await;
        assert_eq!(events, vec![ProgressEvent::Done]);
    }
}
