//! kiln CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or unknown application
//! - 3: Sandbox runtime unavailable
//! - 4: LLM not configured
//! - 5: Configuration error

use std::process::ExitCode;

use clap::Parser;
use kiln_chat::ChatError;
use kiln_core::CoreError;
use kiln_runner::RunnerError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod output;
mod services;

use commands::{Cli, Commands};
use output::StreamFailed;
use services::Services;

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const RUNTIME_UNAVAILABLE: u8 = 3;
    pub const LLM_NOT_CONFIGURED: u8 = 4;
    pub const CONFIG_ERROR: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let default_directive = if verbose { "kiln=debug" } else { "kiln=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{}", default_directive)));

    // Logs go to stderr so streamed output on stdout stays parseable
    let result = if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };

    if result.is_err() {
        // Logging already initialized, continue
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let root = services::resolve_root(cli.root)?;
    let format = cli.format;

    if !cli.command.needs_runtime() {
        if let Commands::New(args) = cli.command {
            return commands::app::new(&root, args).await;
        }
    }

    let services = Services::connect(&root).await?;
    let result = match cli.command {
        Commands::New(args) => commands::app::new(&root, args).await,
        Commands::Chat(args) => commands::chat::execute(&services, args, format).await,
        Commands::Generate(args) => commands::generate::execute(&services, args, format).await,
        Commands::Status(args) => commands::app::status(&services, args, format).await,
        Commands::Stop(args) => commands::app::stop(&services, args).await,
        Commands::Delete(args) => commands::app::delete(&services, args).await,
        Commands::Files(args) => commands::files::files(&services, args, format).await,
        Commands::Cat(args) => commands::files::cat(&services, args).await,
    };
    services.shutdown().await;
    result
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<CoreError>() {
            return core_exit_code(err.code());
        }
        if let Some(err) = cause.downcast_ref::<ChatError>() {
            return match err {
                ChatError::LlmNotConfigured => ExitCodes::LLM_NOT_CONFIGURED,
                ChatError::Core(core) => core_exit_code(core.code()),
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
        if let Some(err) = cause.downcast_ref::<RunnerError>() {
            return match err {
                RunnerError::Unavailable(_) => ExitCodes::RUNTIME_UNAVAILABLE,
                RunnerError::NotFound(_) => ExitCodes::INVALID_ARGS,
                _ => ExitCodes::GENERAL_ERROR,
            };
        }
        if let Some(err) = cause.downcast_ref::<StreamFailed>() {
            return core_exit_code(&err.code);
        }
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("argument") || msg.contains("not found") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

fn core_exit_code(code: &str) -> u8 {
    match code {
        "runtime_unavailable" => ExitCodes::RUNTIME_UNAVAILABLE,
        "not_found" | "invalid_state" | "invalid_transition" => ExitCodes::INVALID_ARGS,
        "config_error" => ExitCodes::CONFIG_ERROR,
        _ => ExitCodes::GENERAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes_follow_error_chain() {
        let err = Err::<(), _>(CoreError::RuntimeUnavailable("daemon down".into()))
            .context("Failed to generate")
            .unwrap_err();
        assert_eq!(categorize_error(&err), ExitCodes::RUNTIME_UNAVAILABLE);

        let err = anyhow::Error::new(ChatError::LlmNotConfigured);
        assert_eq!(categorize_error(&err), ExitCodes::LLM_NOT_CONFIGURED);

        let err = anyhow::Error::new(StreamFailed {
            code: "not_found".to_string(),
            message: "Application not found: x".to_string(),
        });
        assert_eq!(categorize_error(&err), ExitCodes::INVALID_ARGS);

        let err = anyhow::anyhow!("something odd");
        assert_eq!(categorize_error(&err), ExitCodes::GENERAL_ERROR);
    }

    #[test]
    fn test_cli_parses_chat() {
        let cli = Cli::try_parse_from([
            "kiln", "--format", "sse", "chat", "app-1", "--owner", "u1", "a", "todo", "app",
        ])
        .unwrap();
        assert_eq!(cli.format, commands::OutputFormat::Sse);
        assert!(matches!(cli.command, Commands::Chat(_)));
        assert!(cli.command.needs_runtime());
    }
}
