//! Process-wide service wiring.
//!
//! Everything is constructed once in [`Services::connect`] and torn down once
//! in [`Services::shutdown`], which drains the background queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_chat::{ChatManager, DialogueMachine, JsonlConversationStore, LlmAdapter};
use kiln_core::{GenerationPipeline, JsonStore, KilnConfig, LifecycleManager, TaskQueue};
use kiln_runner::DockerRuntime;
use tracing::{debug, info};

/// Resolve the workspace root, defaulting to the current directory.
pub fn resolve_root(root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => std::env::current_dir().context("Failed to determine current directory"),
    }
}

/// Load `.kiln/config.toml` under `root`.
pub fn load_config(root: &Path) -> Result<KilnConfig> {
    KilnConfig::load(root).with_context(|| format!("Failed to load configuration under {:?}", root))
}

/// Open the record store configured for `root`.
pub async fn open_store(root: &Path, config: &KilnConfig) -> Result<Arc<JsonStore>> {
    let data_dir = config.data_dir(root);
    let store = JsonStore::open(&data_dir)
        .await
        .with_context(|| format!("Failed to open data directory {:?}", data_dir))?;
    Ok(Arc::new(store))
}

pub struct Services {
    pub config: KilnConfig,
    pub store: Arc<JsonStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub pipeline: GenerationPipeline,
    pub outbox: Arc<TaskQueue>,
    pub conversations: Arc<JsonlConversationStore>,
}

impl Services {
    /// Load configuration, open storage and connect to the sandbox engine.
    pub async fn connect(root: &Path) -> Result<Self> {
        let config = load_config(root)?;
        let store = open_store(root, &config).await?;

        let runtime = DockerRuntime::connect()
            .await
            .context("Failed to connect to Docker")?
            .with_pull_timeout(config.sandbox.pull_timeout());
        info!("Connected to Docker (image {})", config.sandbox.image);

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::new(runtime),
            store.clone(),
            store.clone(),
            config.sandbox.clone(),
        ));
        let pipeline = GenerationPipeline::new(lifecycle.clone(), config.pipeline.clone());
        let conversations = Arc::new(
            JsonlConversationStore::open(config.data_dir(root))
                .context("Failed to open conversation log")?,
        );

        Ok(Self {
            config,
            store,
            lifecycle,
            pipeline,
            outbox: Arc::new(TaskQueue::start()),
            conversations,
        })
    }

    /// Chat manager backed by the configured LLM provider.
    pub fn chat_manager(&self) -> Result<ChatManager> {
        let adapter = LlmAdapter::from_settings(&self.config.llm)
            .context("Failed to configure the LLM provider")?;
        debug!("Using {:?} model {}", adapter.provider(), adapter.model());

        let dialogue = DialogueMachine::new(
            Arc::new(adapter),
            self.lifecycle.clone(),
            self.outbox.clone(),
        );
        Ok(ChatManager::new(
            dialogue,
            self.conversations.clone(),
            self.outbox.clone(),
        ))
    }

    /// Drain background work and stop the queue.
    pub async fn shutdown(self) {
        let stats = self.outbox.stats();
        self.outbox.shutdown().await;
        debug!(
            "Background queue stopped ({} completed, {} failed)",
            stats.completed(),
            stats.failed()
        );
    }
}
