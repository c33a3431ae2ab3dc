//! # kiln_runner
//!
//! Sandbox runtime client for kiln.
//!
//! This crate wraps a container engine behind the [`SandboxRuntime`] trait:
//! long-lived sandboxes that are created once per application, then driven
//! through shell commands and file transfers while they keep running.
//!
//! # Features
//!
//! - **Docker Runtime**: Docker Engine API via bollard
//! - **File Transfer**: Single-file tar uploads and downloads
//! - **Listings**: `ls -lA` parsing and recursive file trees
//! - **Mock Runtime**: In-memory engine for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_runner::{DockerRuntime, SandboxRuntime, SandboxSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = DockerRuntime::connect().await?;
//!
//!     let spec = SandboxSpec::new("node:18-alpine").port(8000, 6123);
//!     let handle = runtime.create(&spec).await?;
//!     runtime.start(&handle).await?;
//!
//!     let out = runtime.exec(&handle, "node --version", "/").await?;
//!     println!("{} (exit {})", out.output.trim(), out.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod docker;
pub mod error;
pub mod listing;
pub mod mock;
pub mod runner;

pub use config::{ResourceLimits, SandboxSpec};
pub use docker::{DockerRuntime, DEFAULT_PULL_TIMEOUT};
pub use error::{RunnerError, RunnerResult};
pub use listing::{file_tree, parse_ls_output, FileNode, DEFAULT_TREE_DEPTH};
pub use mock::{CapturedCall, MockRuntime};
pub use runner::{short_handle, DirEntry, EntryKind, ExecOutput, SandboxRuntime, SandboxState};
