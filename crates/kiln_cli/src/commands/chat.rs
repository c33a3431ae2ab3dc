//! Chat command - one turn of the requirements dialogue.

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::OutputFormat;
use crate::output::render_stream;
use crate::services::Services;

#[derive(Args)]
pub struct ChatArgs {
    /// Application id
    app: String,

    /// Owner of the application
    #[arg(long)]
    owner: String,

    /// Message text
    #[arg(required = true, num_args = 1..)]
    text: Vec<String>,
}

pub async fn execute(services: &Services, args: ChatArgs, format: OutputFormat) -> Result<()> {
    let text = args.text.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("Invalid argument: message text is empty");
    }

    let chat = services.chat_manager()?;
    info!("Sending message for application {}", args.app);
    let stream = chat
        .send_message(&args.app, &args.owner, &text)
        .await
        .context("Failed to record message")?;

    render_stream(stream, format).await
}
