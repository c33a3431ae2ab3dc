//! Integration tests for the requirements dialogue.

use std::sync::Arc;

use kiln_chat::{
    ChatManager, ConversationStore, DialogueMachine, MemoryConversationStore, MessageRole,
    ScriptedClassifier, FALLBACK_REPLY,
};
use kiln_core::{
    Application, ApplicationStatus, ApplicationStore, LifecycleManager, MemoryStore,
    PortAllocator, ProgressEvent, SandboxSettings, TaskQueue,
};
use kiln_runner::MockRuntime;

struct Harness {
    runtime: MockRuntime,
    store: Arc<MemoryStore>,
    classifier: Arc<ScriptedClassifier>,
    conversations: Arc<MemoryConversationStore>,
    outbox: Arc<TaskQueue>,
    chat: ChatManager,
}

fn harness(responses: &[&str]) -> Harness {
    let runtime = MockRuntime::new();
    let store = Arc::new(MemoryStore::new());
    let lifecycle = Arc::new(
        LifecycleManager::new(
            Arc::new(runtime.clone()),
            store.clone(),
            store.clone(),
            SandboxSettings::default(),
        )
        .with_allocator(PortAllocator::new(8100, 8199).without_host_probe()),
    );
    let classifier = Arc::new(ScriptedClassifier::new(responses.iter().copied()));
    let conversations = Arc::new(MemoryConversationStore::new());
    let outbox = Arc::new(TaskQueue::start());

    let dialogue = DialogueMachine::new(classifier.clone(), lifecycle, outbox.clone());
    let chat = ChatManager::new(dialogue, conversations.clone(), outbox.clone());

    Harness {
        runtime,
        store,
        classifier,
        conversations,
        outbox,
        chat,
    }
}

async fn new_app(store: &MemoryStore) -> Application {
    store
        .insert_application(Application::new("owner-1", "Blog"))
        .await
        .unwrap()
}

fn texts(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Text { content } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_prose_reply_is_streamed_once() {
    let prose = "Happy to help! What kind of application are you thinking of?";
    let h = harness(&[prose]);
    let app = new_app(&h.store).await;

    let events = h
        .chat
        .send_message(&app.id, "owner-1", "hi")
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(texts(&events), vec![prose]);
    assert!(events.last().unwrap().is_terminal());
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(h.classifier.calls(), 1);

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.requirements, None);
    assert!(!stored.requirements_confirmed);
}

#[tokio::test]
async fn test_extract_persists_requirements_and_descriptor() {
    let h = harness(&[
        r#"{"action": "extract", "response": "A blog with tags. Shall I build it?", "requirements": "A blog with tags"}"#,
    ]);
    let app = new_app(&h.store).await;

    let events = h
        .chat
        .send_message(&app.id, "owner-1", "I want a blog with tags")
        .await
        .unwrap()
        .collect_events()
        .await;
    assert_eq!(texts(&events), vec!["A blog with tags. Shall I build it?"]);
    h.outbox.flush().await;

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.requirements.as_deref(), Some("A blog with tags"));
    assert!(!stored.requirements_confirmed);

    let handle = h.runtime.handles().pop().unwrap();
    let descriptor = h.runtime.file(&handle, "/app/task.md").unwrap();
    assert!(descriptor.contains("A blog with tags"));
}

#[tokio::test]
async fn test_start_gen_confirms_and_stops_classifying() {
    let h = harness(&[
        r#"{"action": "extract", "response": "Shall I build a blog?", "requirements": "A blog"}"#,
        r#"{"action": "start_gen", "response": "Great, starting now."}"#,
    ]);
    let app = new_app(&h.store).await;

    h.chat
        .send_message(&app.id, "owner-1", "a blog")
        .await
        .unwrap()
        .collect_events()
        .await;
    let events = h
        .chat
        .send_message(&app.id, "owner-1", "yes")
        .await
        .unwrap()
        .collect_events()
        .await;

    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::RequirementsConfirmed { requirements, .. } if requirements == "A blog"
    )));
    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert!(stored.requirements_confirmed);
    assert_eq!(stored.status, ApplicationStatus::RequirementsConfirmed);

    let again = h
        .chat
        .send_message(&app.id, "owner-1", "also add dark mode")
        .await
        .unwrap()
        .collect_events()
        .await;
    assert_eq!(again.len(), 1);
    assert!(again[0].is_terminal());
    assert_eq!(h.classifier.calls(), 2);
}

#[tokio::test]
async fn test_confirmed_application_log_is_frozen() {
    let h = harness(&[
        r#"{"action": "extract", "response": "Shall I build a blog?", "requirements": "A blog"}"#,
        r#"{"action": "start_gen", "response": "Great, starting now."}"#,
    ]);
    let app = new_app(&h.store).await;

    for text in ["a blog", "yes"] {
        h.chat
            .send_message(&app.id, "owner-1", text)
            .await
            .unwrap()
            .collect_events()
            .await;
    }
    h.chat.flush().await;
    let before = h.chat.history(&app.id).await.unwrap();
    assert_eq!(before.len(), 4);

    h.chat
        .send_message(&app.id, "owner-1", "also add dark mode")
        .await
        .unwrap()
        .collect_events()
        .await;
    h.chat.flush().await;

    let after = h.chat.history(&app.id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.last().map(|m| m.role), Some(MessageRole::Assistant));
}

#[tokio::test]
async fn test_reply_saved_once_per_turn() {
    let h = harness(&[
        r#"{"action": "clarify", "response": "Who will read the blog?", "clarifying_questions": ["Who will read the blog?"]}"#,
    ]);
    let app = new_app(&h.store).await;

    h.chat
        .send_message(&app.id, "owner-1", "a blog")
        .await
        .unwrap()
        .collect_events()
        .await;
    h.chat.flush().await;

    let history = h.chat.history(&app.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, MessageRole::User);
    assert_eq!(history[1].role, MessageRole::Assistant);
    assert_eq!(history[1].content, "Who will read the blog?");
    assert_eq!(history[0].turn, history[1].turn);

    let duplicate = kiln_chat::Message::assistant("Who will read the blog?", history[1].turn);
    assert!(!h
        .conversations
        .append_reply(&app.id, duplicate)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_clarifying_question_shapes_next_prompt() {
    let h = harness(&[
        r#"{"action": "clarify", "response": "Who will read the blog?"}"#,
        r#"{"action": "continue", "response": "Got it."}"#,
    ]);
    let app = new_app(&h.store).await;

    for text in ["a blog", "my friends"] {
        h.chat
            .send_message(&app.id, "owner-1", text)
            .await
            .unwrap()
            .collect_events()
            .await;
        h.chat.flush().await;
    }

    let prompt = h.classifier.last_prompt().unwrap();
    assert!(prompt.contains("Who will read the blog?"));
    assert_eq!(h.chat.history(&app.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_classifier_failure_falls_back() {
    let h = harness(&[]);
    let app = new_app(&h.store).await;

    let events = h
        .chat
        .send_message(&app.id, "owner-1", "hello")
        .await
        .unwrap()
        .collect_events()
        .await;

    assert!(!events.iter().any(|e| e.is_error()));
    assert_eq!(texts(&events), vec![FALLBACK_REPLY]);
}

#[tokio::test]
async fn test_other_owner_is_not_found() {
    let h = harness(&[r#"{"action": "continue", "response": "Hi"}"#]);
    let app = new_app(&h.store).await;

    let events = h
        .chat
        .send_message(&app.id, "someone-else", "hello")
        .await
        .unwrap()
        .collect_events()
        .await;

    assert!(matches!(
        &events[0],
        ProgressEvent::Error { code, .. } if code == "not_found"
    ));
    assert_eq!(h.classifier.calls(), 0);
}
