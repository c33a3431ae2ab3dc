//! Progress events and the ordered stream that carries them.
//!
//! A [`ProgressStream`] has exactly one producer. Whatever the producer does
//! (succeed, fail or panic), the stream ends with one `error` event at most
//! followed by exactly one [`ProgressEvent::Done`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use kiln_runner::ExecOutput;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{CoreError, CoreResult};

const STREAM_BUFFER: usize = 64;

/// A tool invoked by the pipeline, with its typed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum ToolInvocation {
    CreateFile { path: String, purpose: String },
    CreateDirectory { paths: Vec<String> },
    InstallDependencies { package_manager: String },
    StartServer { command: String },
}

impl ToolInvocation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::CreateDirectory { .. } => "create_directory",
            Self::InstallDependencies { .. } => "install_dependencies",
            Self::StartServer { .. } => "start_server",
        }
    }
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl ToolOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            exit_code: None,
            output: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: message.into(),
        }
    }
}

impl From<&ExecOutput> for ToolOutcome {
    fn from(out: &ExecOutput) -> Self {
        Self {
            success: out.success(),
            exit_code: Some(out.exit_code),
            output: out.output.clone(),
        }
    }
}

/// One unit of progress reported to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProgressEvent {
    Thought {
        content: String,
    },
    ToolCall(ToolInvocation),
    ToolCallResult {
        tool: String,
        result: ToolOutcome,
    },
    Text {
        content: String,
    },
    Error {
        message: String,
        code: String,
    },
    /// Requirements were confirmed in this turn; generation may be offered.
    RequirementsConfirmed {
        requirements: String,
        message: String,
    },
    /// Terminal marker.
    Done,
}

impl ProgressEvent {
    pub fn thought(content: impl Into<String>) -> Self {
        Self::Thought {
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thought { .. } => "thought",
            Self::ToolCall(_) => "tool_call",
            Self::ToolCallResult { .. } => "tool_call_result",
            Self::Text { .. } => "text",
            Self::Error { .. } => "error",
            Self::RequirementsConfirmed { .. } => "requirements_confirmed",
            Self::Done => "done",
        }
    }

    /// Render as a server-sent event frame.
    ///
    /// Payload events become `data: {"type", "data", "timestamp"}`; the
    /// terminal marker becomes `data: [DONE]`.
    pub fn to_sse(&self) -> String {
        if self.is_terminal() {
            return "data: [DONE]\n\n".to_string();
        }

        let mut value = serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "type": "error",
                "data": { "message": e.to_string(), "code": "serialization_error" },
            })
        });
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "timestamp".to_string(),
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        format!("data: {}\n\n", value)
    }
}

impl From<&CoreError> for ProgressEvent {
    fn from(err: &CoreError) -> Self {
        Self::error(err.to_string(), err.code())
    }
}

/// Producer handle for a [`ProgressStream`].
///
/// Each send is a suspension point followed by a yield, so a slow producer
/// never starves the consumer.
pub struct EventEmitter {
    tx: mpsc::Sender<ProgressEvent>,
    emitted_texts: Vec<String>,
}

impl EventEmitter {
    fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self {
            tx,
            emitted_texts: Vec::new(),
        }
    }

    /// Send one event. The terminal marker is owned by the stream and ignored here.
    ///
    /// Fails with [`CoreError::Cancelled`] once the consumer has gone away.
    pub async fn emit(&mut self, event: ProgressEvent) -> CoreResult<()> {
        if event.is_terminal() {
            return Ok(());
        }
        if let ProgressEvent::Text { content } = &event {
            self.emitted_texts.push(content.clone());
        }

        tokio::task::yield_now().await;
        self.tx
            .send(event)
            .await
            .map_err(|_| CoreError::Cancelled("progress stream closed".to_string()))?;
        tokio::task::yield_now().await;
        Ok(())
    }

    pub async fn thought(&mut self, content: impl Into<String>) -> CoreResult<()> {
        self.emit(ProgressEvent::thought(content)).await
    }

    pub async fn text(&mut self, content: impl Into<String>) -> CoreResult<()> {
        self.emit(ProgressEvent::text(content)).await
    }

    pub async fn tool_call(&mut self, invocation: ToolInvocation) -> CoreResult<()> {
        self.emit(ProgressEvent::ToolCall(invocation)).await
    }

    pub async fn tool_result(&mut self, tool: &str, result: ToolOutcome) -> CoreResult<()> {
        self.emit(ProgressEvent::ToolCallResult {
            tool: tool.to_string(),
            result,
        })
        .await
    }

    /// Whether a text event with exactly this content was already sent.
    pub fn has_emitted_text(&self, content: &str) -> bool {
        self.emitted_texts.iter().any(|t| t == content)
    }

    /// Whether the consumer has dropped its end.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Ordered stream of progress events ending in exactly one terminal marker.
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Run `producer` in its own task and stream what it emits.
    ///
    /// An `Err` from the producer becomes one `error` event; a panic is
    /// reported the same way. The terminal marker always follows.
    pub fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(EventEmitter) -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let emitter = EventEmitter::new(tx.clone());

        tokio::spawn(async move {
            let outcome = tokio::spawn(producer(emitter)).await;

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(CoreError::Cancelled(reason))) => {
                    debug!("Progress producer stopped: {}", reason);
                    None
                }
                Ok(Err(e)) => Some(ProgressEvent::from(&e)),
                Err(join_error) => {
                    error!("Progress producer panicked: {}", join_error);
                    Some(ProgressEvent::error(
                        "internal error while processing request",
                        "internal",
                    ))
                }
            };

            if let Some(event) = failure {
                let _ = tx.send(event).await;
            }
            let _ = tx.send(ProgressEvent::Done).await;
        });

        Self { rx }
    }

    /// A stream holding only the terminal marker.
    pub fn finished() -> Self {
        Self::spawn(|_| async { Ok::<(), CoreError>(()) })
    }

    /// Receive the next event; `None` after the terminal marker was taken.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Drain the stream into a vector, terminal marker included.
    pub async fn collect_events(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Accumulates assistant text from a stream, suppressing restatements.
///
/// Exact repeats are ignored, a strictly longer text that extends an earlier
/// one replaces it, and a prefix of an earlier text is ignored.
#[derive(Debug, Clone, Default)]
pub struct AssistantTranscript {
    segments: Vec<String>,
}

impl AssistantTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `text`; returns whether it is new content worth forwarding.
    pub fn observe(&mut self, text: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }
        if self.segments.iter().any(|s| s.starts_with(text)) {
            return false;
        }
        if let Some(pos) = self.segments.iter().position(|s| text.starts_with(s.as_str())) {
            self.segments[pos] = text.to_string();
            return true;
        }
        self.segments.push(text.to_string());
        true
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Full assistant text, segments separated by blank lines.
    pub fn text(&self) -> String {
        self.segments.join("\n\n")
    }
}
