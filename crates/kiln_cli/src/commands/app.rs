//! Application commands: new, status, stop, delete.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use kiln_core::{Application, ApplicationStore, CoreError, SandboxStatus};
use kiln_runner::{short_handle, SandboxState};
use serde::Serialize;
use tracing::info;

use super::OutputFormat;
use crate::services::{self, Services};

#[derive(Args)]
pub struct NewArgs {
    /// Owner of the application
    #[arg(long)]
    owner: String,

    /// Display name
    #[arg(long, default_value = "Untitled application")]
    name: String,
}

#[derive(Args)]
pub struct AppArgs {
    /// Application id
    app: String,
}

pub async fn new(root: &Path, args: NewArgs) -> Result<()> {
    let config = services::load_config(root)?;
    let store = services::open_store(root, &config).await?;

    let app = store
        .insert_application(Application::new(args.owner, args.name))
        .await
        .context("Failed to create application")?;
    info!("Created application {}", app.id);

    println!("✅ Created application {}", app.id);
    println!();
    println!("Next steps:");
    println!("  kiln chat {} --owner {} \"describe your app\"", app.id, app.owner_id);
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    application: Application,
    sandbox_status: Option<SandboxStatus>,
    sandbox_state: Option<SandboxState>,
}

pub async fn status(services: &Services, args: AppArgs, format: OutputFormat) -> Result<()> {
    let application = services.lifecycle.application(&args.app).await?;
    let record = services.lifecycle.sandbox(&args.app).await?;
    let sandbox_state = services.lifecycle.live_state(&args.app).await?;

    if format == OutputFormat::Sse {
        let report = StatusReport {
            application,
            sandbox_status: record.map(|r| r.status),
            sandbox_state,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Application:  {} ({})", application.name, application.id);
    println!("Owner:        {}", application.owner_id);
    println!("Status:       {}", application.status);
    println!(
        "Requirements: {}",
        match (application.requirements_text(), application.requirements_confirmed) {
            (Some(_), true) => "confirmed",
            (Some(_), false) => "awaiting confirmation",
            (None, _) => "not yet gathered",
        }
    );
    match record {
        Some(record) => {
            println!(
                "Sandbox:      {} ({}, engine: {})",
                short_handle(&record.handle),
                record.status,
                sandbox_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "missing".to_string())
            );
            if let Some(port) = record.port {
                println!("Port:         {}", port);
            }
        }
        None => println!("Sandbox:      none"),
    }
    if let Some(url) = application.preview_url {
        println!("Preview:      {}", url);
    }
    Ok(())
}

pub async fn stop(services: &Services, args: AppArgs) -> Result<()> {
    services.lifecycle.application(&args.app).await?;
    match services.lifecycle.stop(&args.app).await {
        Ok(()) => {
            println!("⏹  Stopped sandbox for {}", args.app);
            Ok(())
        }
        Err(CoreError::EntityNotFound { .. }) => {
            println!("No sandbox running for {}", args.app);
            Ok(())
        }
        Err(e) => Err(e).context("Failed to stop sandbox"),
    }
}

pub async fn delete(services: &Services, args: AppArgs) -> Result<()> {
    services
        .lifecycle
        .delete_application(&args.app)
        .await
        .context("Failed to delete application")?;
    println!("🗑  Deleted application {}", args.app);
    Ok(())
}
