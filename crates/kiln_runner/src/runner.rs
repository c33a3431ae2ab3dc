//! Sandbox runtime trait and types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SandboxSpec;
use crate::error::RunnerResult;

/// Result of a command executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code reported by the engine
    pub exit_code: i64,
    /// Stdout followed by stderr
    pub output: String,
}

impl ExecOutput {
    pub fn new(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    /// Check if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A single entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
}

/// Run status of a sandbox as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl SandboxState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Operational primitive over an isolated execution environment.
///
/// Every method fails with [`RunnerError::Unavailable`](crate::RunnerError::Unavailable)
/// when the engine cannot be reached and with
/// [`RunnerError::NotFound`](crate::RunnerError::NotFound) when the handle is stale.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Provision a sandbox, pulling its image on demand. Returns the handle.
    async fn create(&self, spec: &SandboxSpec) -> RunnerResult<String>;

    /// Start a created sandbox.
    async fn start(&self, handle: &str) -> RunnerResult<()>;

    /// Stop a sandbox, waiting at most `timeout` before killing it.
    async fn stop(&self, handle: &str, timeout: Duration) -> RunnerResult<()>;

    /// Remove a sandbox.
    async fn remove(&self, handle: &str, force: bool) -> RunnerResult<()>;

    /// Run a shell command inside the sandbox.
    async fn exec(&self, handle: &str, command: &str, workdir: &str) -> RunnerResult<ExecOutput>;

    /// Write a text file, creating parent directories.
    async fn write_file(&self, handle: &str, path: &str, content: &str) -> RunnerResult<()>;

    /// Read a text file; `None` if it does not exist.
    async fn read_file(&self, handle: &str, path: &str) -> RunnerResult<Option<String>>;

    /// List the direct children of a directory.
    async fn list_directory(&self, handle: &str, path: &str) -> RunnerResult<Vec<DirEntry>>;

    /// Host port the engine actually bound for `container_port`.
    async fn port_mapping(&self, handle: &str, container_port: u16) -> RunnerResult<Option<u16>>;

    /// Current run status.
    async fn status(&self, handle: &str) -> RunnerResult<SandboxState>;
}

/// Shorten a handle for log output.
pub fn short_handle(handle: &str) -> &str {
    let end = handle
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(handle.len());
    &handle[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        assert!(ExecOutput::new(0, "ok").success());
        assert!(!ExecOutput::new(127, "sh: nc: not found").success());
    }

    #[test]
    fn test_short_handle() {
        assert_eq!(short_handle("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_handle("abc"), "abc");
    }

    #[test]
    fn test_dir_entry_serializes_type_field() {
        let entry = DirEntry {
            name: "src".to_string(),
            kind: EntryKind::Directory,
            size: 0,
            permissions: String::new(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "directory");
        assert!(json.get("permissions").is_none());
    }
}
