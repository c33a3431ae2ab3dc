//! Sandbox file commands: files, cat.

use anyhow::{Context, Result};
use clap::Args;
use kiln_runner::{EntryKind, FileNode};

use super::OutputFormat;
use crate::services::Services;

#[derive(Args)]
pub struct FilesArgs {
    /// Application id
    app: String,

    /// Directory to list (defaults to the sandbox working directory)
    #[arg(long)]
    path: Option<String>,
}

#[derive(Args)]
pub struct CatArgs {
    /// Application id
    app: String,

    /// Absolute path inside the sandbox
    path: String,
}

pub async fn files(services: &Services, args: FilesArgs, format: OutputFormat) -> Result<()> {
    services.lifecycle.application(&args.app).await?;
    let tree = services
        .lifecycle
        .file_tree(&args.app, args.path.as_deref())
        .await
        .context("Failed to list sandbox files")?;

    if format == OutputFormat::Sse {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }

    let mut lines = Vec::new();
    render_tree(&tree, 0, &mut lines);
    if lines.is_empty() {
        println!("(empty)");
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

pub async fn cat(services: &Services, args: CatArgs) -> Result<()> {
    services.lifecycle.application(&args.app).await?;
    match services.lifecycle.read_file(&args.app, &args.path).await? {
        Some(content) => {
            print!("{}", content);
            Ok(())
        }
        None => anyhow::bail!("File not found in sandbox: {}", args.path),
    }
}

fn render_tree(nodes: &[FileNode], depth: usize, lines: &mut Vec<String>) {
    for node in nodes {
        let indent = "  ".repeat(depth);
        match node.kind {
            EntryKind::Directory => {
                lines.push(format!("{}{}/", indent, node.name));
                render_tree(&node.children, depth + 1, lines);
            }
            EntryKind::File => lines.push(format!("{}{} ({} B)", indent, node.name, node.size)),
        }
    }
}
