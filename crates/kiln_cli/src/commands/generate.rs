//! Generate command - build and deploy confirmed requirements.

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::OutputFormat;
use crate::output::render_stream;
use crate::services::Services;

#[derive(Args)]
pub struct GenerateArgs {
    /// Application id
    app: String,

    /// Generate even if the requirements were not confirmed in chat
    #[arg(long)]
    force: bool,
}

pub async fn execute(services: &Services, args: GenerateArgs, format: OutputFormat) -> Result<()> {
    let app = services.lifecycle.application(&args.app).await?;

    let Some(requirements) = app.requirements_text().map(str::to_string) else {
        anyhow::bail!(
            "Invalid argument: application {} has no requirements yet; use `kiln chat` first",
            app.id
        );
    };
    if !app.requirements_confirmed && !args.force {
        anyhow::bail!(
            "Invalid argument: requirements for {} are not confirmed (use --force to generate anyway)",
            app.id
        );
    }

    info!("Generating application {} ({} chars of requirements)", app.id, requirements.len());
    let stream = services.pipeline.generate_and_deploy(&app.id, &requirements);
    render_stream(stream, format).await?;

    if format == OutputFormat::Text {
        if let Some(url) = services.lifecycle.application(&app.id).await?.preview_url {
            println!();
            println!("🚀 Preview: {}", url);
        }
    }
    Ok(())
}
