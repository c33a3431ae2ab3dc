//! # kiln_core
//!
//! Application model, sandbox lifecycle and the generation pipeline.
//!
//! # Architecture
//!
//! - **Store**: persisted applications and sandbox records
//! - **Lifecycle**: one sandbox per application, created or reused on demand
//! - **Pipeline**: turns confirmed requirements into a running preview
//! - **Events**: the ordered progress stream consumed by delivery channels
//! - **Outbox**: background persistence with retry
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kiln_core::{
//!     Application, GenerationPipeline, KilnConfig, LifecycleManager, MemoryStore,
//! };
//! use kiln_runner::DockerRuntime;
//!
//! let config = KilnConfig::load(&workspace)?;
//! let store = Arc::new(MemoryStore::new());
//! let lifecycle = Arc::new(LifecycleManager::new(
//!     Arc::new(DockerRuntime::connect()?),
//!     store.clone(),
//!     store.clone(),
//!     config.sandbox.clone(),
//! ));
//!
//! let app = store.insert_application(Application::new("owner-1", "Todo")).await?;
//! let pipeline = GenerationPipeline::new(lifecycle, config.pipeline.clone());
//! let events = pipeline
//!     .generate_and_deploy(&app.id, "a todo list app")
//!     .collect_events()
//!     .await;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod outbox;
pub mod pipeline;
pub mod ports;
pub mod store;

// Re-export main types for convenience
pub use config::{KilnConfig, LlmSettings, PipelineSettings, SandboxSettings, StorageSettings, KILN_DIR};
pub use error::{CoreError, CoreResult};
pub use events::{
    AssistantTranscript, EventEmitter, ProgressEvent, ProgressStream, ToolInvocation, ToolOutcome,
};
pub use lifecycle::{render_task_descriptor, LifecycleManager, SandboxRequest, TASK_DESCRIPTOR_FILE};
pub use locks::{KeyGuard, KeyedLocks};
pub use models::{
    Application, ApplicationStatus, ApplicationUpdate, SandboxRecord, SandboxStatus, SandboxUpdate,
};
pub use outbox::{BackgroundJob, QueueStats, RetryPolicy, TaskQueue};
pub use pipeline::GenerationPipeline;
pub use ports::PortAllocator;
pub use store::{ApplicationStore, JsonStore, MemoryStore, SandboxStore};
