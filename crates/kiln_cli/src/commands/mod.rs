//! CLI command definitions.
//!
//! This module defines the command structure for the kiln CLI. Each
//! subcommand maps to one operation on an application.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

pub mod app;
pub mod chat;
pub mod files;
pub mod generate;

/// kiln - describe an application, confirm it, get a running preview
#[derive(Parser)]
#[command(name = "kiln")]
#[command(version, about = "kiln - conversational application generation in sandboxes")]
#[command(long_about = r#"
kiln turns a conversation into confirmed requirements, then generates the
application inside a disposable sandbox and starts a preview server.

WORKFLOW:
  new       → Register an application
  chat      → Send one message to the requirements dialogue
  generate  → Generate and deploy confirmed requirements
  status    → Show application and sandbox state
  stop      → Stop the sandbox (files are kept)
  delete    → Remove the sandbox and the application
  files     → Show the sandbox file tree
  cat       → Print one file from the sandbox

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or unknown application
  3 - Sandbox runtime unavailable
  4 - LLM not configured
  5 - Configuration error
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace root holding `.kiln/` (defaults to current directory)
    #[arg(long, global = true, env = "KILN_ROOT")]
    pub root: Option<PathBuf>,

    /// Output format for streamed progress
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// How progress events are written to stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// Server-sent event frames
    Sse,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new application
    New(app::NewArgs),

    /// Send a message to the requirements dialogue
    Chat(chat::ChatArgs),

    /// Generate and deploy the confirmed requirements
    Generate(generate::GenerateArgs),

    /// Show application and sandbox state
    Status(app::AppArgs),

    /// Stop the application's sandbox
    Stop(app::AppArgs),

    /// Delete the application and its sandbox
    Delete(app::AppArgs),

    /// Show the sandbox file tree
    Files(files::FilesArgs),

    /// Print a file from the sandbox
    Cat(files::CatArgs),
}

impl Commands {
    /// Whether the command needs a sandbox runtime connection.
    pub fn needs_runtime(&self) -> bool {
        !matches!(self, Self::New(_))
    }
}
