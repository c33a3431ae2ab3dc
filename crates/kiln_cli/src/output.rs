//! Rendering of progress streams on stdout.

use std::io::Write;

use anyhow::Result;
use futures::StreamExt;
use kiln_core::{ProgressEvent, ProgressStream, ToolInvocation};

use crate::commands::OutputFormat;

/// An `error` event ended the stream.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StreamFailed {
    pub code: String,
    pub message: String,
}

/// Write every event of `stream` to stdout.
///
/// Returns [`StreamFailed`] when the stream carried an error event.
pub async fn render_stream(mut stream: ProgressStream, format: OutputFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut failure = None;

    while let Some(event) = stream.next().await {
        if let ProgressEvent::Error { code, message } = &event {
            failure = Some(StreamFailed {
                code: code.clone(),
                message: message.clone(),
            });
        }

        let mut out = stdout.lock();
        match format {
            OutputFormat::Sse => write!(out, "{}", event.to_sse())?,
            OutputFormat::Text => {
                if let Some(line) = describe(&event) {
                    writeln!(out, "{}", line)?;
                }
            }
        }
        out.flush()?;

        if event.is_terminal() {
            break;
        }
    }

    match failure {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}

/// One human-readable line per event; the terminal marker prints nothing.
pub fn describe(event: &ProgressEvent) -> Option<String> {
    let line = match event {
        ProgressEvent::Thought { content } => format!("… {}", content),
        ProgressEvent::ToolCall(invocation) => format!("→ {}", describe_invocation(invocation)),
        ProgressEvent::ToolCallResult { tool, result } => {
            if result.success {
                format!("  ✓ {}", tool)
            } else {
                let detail = result.output.lines().next().unwrap_or_default();
                match result.exit_code {
                    Some(code) => format!("  ✗ {} (exit {}) {}", tool, code, detail),
                    None => format!("  ✗ {} {}", tool, detail),
                }
            }
        }
        ProgressEvent::Text { content } => content.clone(),
        ProgressEvent::Error { message, code } => format!("❌ {} [{}]", message, code),
        ProgressEvent::RequirementsConfirmed { .. } => {
            "✅ Requirements confirmed. Run `kiln generate` to build the application.".to_string()
        }
        ProgressEvent::Done => return None,
    };
    Some(line)
}

fn describe_invocation(invocation: &ToolInvocation) -> String {
    match invocation {
        ToolInvocation::CreateFile { path, purpose } => format!("create {} ({})", path, purpose),
        ToolInvocation::CreateDirectory { paths } => format!("mkdir {}", paths.join(" ")),
        ToolInvocation::InstallDependencies { package_manager } => {
            format!("install dependencies with {}", package_manager)
        }
        ToolInvocation::StartServer { command } => format!("start server: {}", command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::ToolOutcome;

    #[test]
    fn test_describe_events() {
        assert_eq!(describe(&ProgressEvent::Done), None);
        assert_eq!(
            describe(&ProgressEvent::text("Hello")).as_deref(),
            Some("Hello")
        );

        let call = ProgressEvent::ToolCall(ToolInvocation::CreateFile {
            path: "/app/index.html".to_string(),
            purpose: "Main page".to_string(),
        });
        assert_eq!(
            describe(&call).as_deref(),
            Some("→ create /app/index.html (Main page)")
        );

        let failed = ProgressEvent::ToolCallResult {
            tool: "install_dependencies".to_string(),
            result: ToolOutcome {
                success: false,
                exit_code: Some(1),
                output: "npm ERR! timeout\nmore".to_string(),
            },
        };
        assert_eq!(
            describe(&failed).as_deref(),
            Some("  ✗ install_dependencies (exit 1) npm ERR! timeout")
        );
    }

    #[tokio::test]
    async fn test_error_event_fails_render() {
        let stream = ProgressStream::spawn(|_| async {
            Err(kiln_core::CoreError::RuntimeUnavailable("down".to_string()))
        });
        let err = render_stream(stream, OutputFormat::Sse).await.unwrap_err();
        let failed = err.downcast_ref::<StreamFailed>().unwrap();
        assert_eq!(failed.code, "runtime_unavailable");
    }
}
