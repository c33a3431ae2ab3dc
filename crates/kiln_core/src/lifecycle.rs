//! Sandbox lifecycle management.
//!
//! Every application owns at most one sandbox. All operations that may
//! create, replace or remove that sandbox hold the application's key lock,
//! so concurrent callers observe a single provisioning.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use kiln_runner::{
    file_tree, short_handle, ExecOutput, FileNode, ResourceLimits, RunnerError, SandboxRuntime,
    SandboxSpec, SandboxState, DEFAULT_TREE_DEPTH,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SandboxSettings;
use crate::error::{CoreError, CoreResult};
use crate::locks::KeyedLocks;
use crate::models::{
    Application, ApplicationStatus, ApplicationUpdate, SandboxRecord, SandboxStatus, SandboxUpdate,
};
use crate::ports::PortAllocator;
use crate::store::{ApplicationStore, SandboxStore};

/// File name of the task descriptor inside the sandbox working directory.
pub const TASK_DESCRIPTOR_FILE: &str = "task.md";

/// What to provision for a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub image: String,
    pub limits: ResourceLimits,
    /// Host port to bind; allocated from the pool when `None`
    pub host_port: Option<u16>,
}

impl SandboxRequest {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            image: settings.image.clone(),
            limits: settings.limits(),
            host_port: None,
        }
    }

    pub fn host_port(mut self, port: u16) -> Self {
        self.host_port = Some(port);
        self
    }
}

/// Render the task descriptor written into a sandbox.
pub fn render_task_descriptor(requirements: &str) -> String {
    format!(
        "# Task Specification\n\
         \n\
         ## Requirements\n\
         \n\
         {}\n\
         \n\
         ## Implementation Status\n\
         \n\
         - [ ] Requirements confirmed\n\
         - [ ] Initial setup complete\n\
         - [ ] Core functionality implemented\n\
         - [ ] Testing complete\n\
         - [ ] Deployment ready\n\
         \n\
         ## Notes\n\
         \n\
         Generated from the conversation requirements on {}.\n\
         This file is rewritten whenever the requirements change.\n",
        requirements,
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    )
}

/// Orchestrates the sandbox runtime and the persisted records.
pub struct LifecycleManager {
    runtime: Arc<dyn SandboxRuntime>,
    applications: Arc<dyn ApplicationStore>,
    sandboxes: Arc<dyn SandboxStore>,
    settings: SandboxSettings,
    allocator: PortAllocator,
    locks: KeyedLocks,
    // Serializes port selection across applications
    port_lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        applications: Arc<dyn ApplicationStore>,
        sandboxes: Arc<dyn SandboxStore>,
        settings: SandboxSettings,
    ) -> Self {
        Self {
            allocator: PortAllocator::from_settings(&settings),
            runtime,
            applications,
            sandboxes,
            settings,
            locks: KeyedLocks::new(),
            port_lock: Mutex::new(()),
        }
    }

    pub fn with_allocator(mut self, allocator: PortAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn runtime(&self) -> &Arc<dyn SandboxRuntime> {
        &self.runtime
    }

    pub fn applications(&self) -> &Arc<dyn ApplicationStore> {
        &self.applications
    }

    /// Externally reachable address for a host port.
    pub fn preview_url(&self, port: u16) -> String {
        self.settings.preview_url(port)
    }

    /// Load an application or fail with `EntityNotFound`.
    pub async fn application(&self, application_id: &str) -> CoreResult<Application> {
        self.applications
            .get_application(application_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Application", application_id))
    }

    /// Persisted sandbox record, if any.
    pub async fn sandbox(&self, application_id: &str) -> CoreResult<Option<SandboxRecord>> {
        self.sandboxes.get_sandbox(application_id).await
    }

    /// Live engine state of the application's sandbox, if one is recorded.
    pub async fn live_state(&self, application_id: &str) -> CoreResult<Option<SandboxState>> {
        let Some(record) = self.sandboxes.get_sandbox(application_id).await? else {
            return Ok(None);
        };
        match self.runtime.status(&record.handle).await {
            Ok(state) => Ok(Some(state)),
            Err(RunnerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Provision and start a sandbox for an application.
    ///
    /// On failure after the engine created the sandbox, the record is left in
    /// `error`; if creation itself failed, no record is written.
    pub async fn create_and_start(
        &self,
        application_id: &str,
        request: SandboxRequest,
    ) -> CoreResult<SandboxRecord> {
        let _guard = self.locks.lock(application_id).await;
        self.create_and_start_locked(application_id, request).await
    }

    async fn create_and_start_locked(
        &self,
        application_id: &str,
        request: SandboxRequest,
    ) -> CoreResult<SandboxRecord> {
        let host_port = match request.host_port {
            Some(port) => port,
            None => self.allocate_port(application_id).await?,
        };

        let spec = SandboxSpec::new(&request.image)
            .name_prefix(format!("kiln-{}", name_fragment(application_id)))
            .limits(request.limits)
            .port(self.settings.internal_port, host_port)
            .env("PORT", self.settings.internal_port.to_string());

        info!(
            "Creating sandbox for application {} (image {}, host port {})",
            application_id, request.image, host_port
        );
        let handle = self.runtime.create(&spec).await?;

        let mut record =
            SandboxRecord::new(&handle, application_id, &request.image, request.limits);
        record.port = Some(host_port);
        self.sandboxes.put_sandbox(record).await?;

        match self.start_and_reconcile(application_id, &handle, host_port).await {
            Ok(record) => {
                info!(
                    "Sandbox {} running for application {} on port {:?}",
                    short_handle(&handle),
                    application_id,
                    record.port
                );
                Ok(record)
            }
            Err(e) => {
                error!(
                    "Sandbox {} for application {} failed to start: {}",
                    short_handle(&handle),
                    application_id,
                    e
                );
                if let Err(mark_err) = self
                    .sandboxes
                    .update_sandbox(application_id, SandboxUpdate::status(SandboxStatus::Error))
                    .await
                {
                    error!("Could not mark sandbox {} as failed: {}", short_handle(&handle), mark_err);
                }
                Err(e)
            }
        }
    }

    async fn start_and_reconcile(
        &self,
        application_id: &str,
        handle: &str,
        requested_port: u16,
    ) -> CoreResult<SandboxRecord> {
        self.runtime.start(handle).await?;

        let workdir = &self.settings.workdir;
        let mkdir = self
            .runtime
            .exec(handle, &format!("mkdir -p {}", workdir), "/")
            .await?;
        if !mkdir.success() {
            return Err(CoreError::Sandbox(format!(
                "could not create {}: {}",
                workdir,
                mkdir.output.trim()
            )));
        }

        // The engine's binding is authoritative
        let port = match self
            .runtime
            .port_mapping(handle, self.settings.internal_port)
            .await?
        {
            Some(actual) if actual != requested_port => {
                warn!(
                    "Sandbox {} bound port {} instead of requested {}",
                    short_handle(handle),
                    actual,
                    requested_port
                );
                actual
            }
            Some(actual) => actual,
            None => requested_port,
        };

        self.sandboxes
            .update_sandbox(
                application_id,
                SandboxUpdate::status(SandboxStatus::Running).port(Some(port)),
            )
            .await?
            .ok_or_else(|| CoreError::not_found("Sandbox", handle))
    }

    /// Return the application's sandbox, creating or repairing it as needed.
    ///
    /// Safe to call concurrently: callers for the same application are
    /// serialized and all observe the same handle.
    pub async fn get_or_create(&self, application_id: &str) -> CoreResult<SandboxRecord> {
        let _guard = self.locks.lock(application_id).await;
        let app = self.application(application_id).await?;

        if let Some(record) = self.sandboxes.get_sandbox(application_id).await? {
            if let Some(record) = self.revive_locked(record).await? {
                self.link_application(&app, &record).await?;
                return Ok(record);
            }
        }

        let record = self
            .create_and_start_locked(application_id, SandboxRequest::from_settings(&self.settings))
            .await?;
        self.link_application(&app, &record).await?;
        Ok(record)
    }

    /// Bring an existing record back into service. Returns `None` when the
    /// sandbox was unusable and has been torn down.
    async fn revive_locked(&self, record: SandboxRecord) -> CoreResult<Option<SandboxRecord>> {
        let handle = short_handle(&record.handle).to_string();

        if record.status == SandboxStatus::Error {
            info!("Replacing failed sandbox {} for {}", handle, record.application_id);
            self.teardown_locked(&record).await?;
            return Ok(None);
        }

        let state = match self.runtime.status(&record.handle).await {
            Ok(state) => state,
            Err(RunnerError::NotFound(_)) => {
                warn!(
                    "Sandbox {} for {} no longer exists; recreating",
                    handle, record.application_id
                );
                self.sandboxes.delete_sandbox(&record.application_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if state.is_running() {
            if record.status == SandboxStatus::Running {
                return Ok(Some(record));
            }
            let updated = self
                .sandboxes
                .update_sandbox(&record.application_id, SandboxUpdate::status(SandboxStatus::Running))
                .await?;
            return Ok(updated);
        }

        debug!("Sandbox {} is {}; starting it", handle, state);
        match self.runtime.start(&record.handle).await {
            Ok(()) => {
                let updated = self
                    .sandboxes
                    .update_sandbox(
                        &record.application_id,
                        SandboxUpdate::status(SandboxStatus::Running),
                    )
                    .await?;
                Ok(updated)
            }
            Err(RunnerError::Unavailable(msg)) => Err(CoreError::RuntimeUnavailable(msg)),
            Err(e) => {
                warn!("Sandbox {} could not be restarted ({}); recreating", handle, e);
                self.teardown_locked(&record).await?;
                Ok(None)
            }
        }
    }

    async fn link_application(&self, app: &Application, record: &SandboxRecord) -> CoreResult<()> {
        if app.sandbox_handle.as_deref() == Some(record.handle.as_str()) && app.port == record.port {
            return Ok(());
        }
        self.applications
            .update_application(
                &app.id,
                ApplicationUpdate::new()
                    .sandbox_handle(Some(record.handle.clone()))
                    .port(record.port),
            )
            .await?;
        Ok(())
    }

    async fn teardown_locked(&self, record: &SandboxRecord) -> CoreResult<()> {
        match self.runtime.remove(&record.handle, true).await {
            Ok(()) | Err(RunnerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.sandboxes.delete_sandbox(&record.application_id).await?;
        Ok(())
    }

    /// Ports held by other applications' records.
    async fn taken_ports(&self, application_id: &str) -> CoreResult<HashSet<u16>> {
        let mut taken: HashSet<u16> = HashSet::new();
        for app in self.applications.list_applications(None).await? {
            if app.id != application_id {
                taken.extend(app.port);
            }
        }
        let own = self
            .sandboxes
            .get_sandbox(application_id)
            .await?
            .and_then(|r| r.port);
        for port in self.sandboxes.recorded_ports().await? {
            if Some(port) != own {
                taken.insert(port);
            }
        }
        Ok(taken)
    }

    /// Choose a free host port for the application and record it.
    pub async fn allocate_port(&self, application_id: &str) -> CoreResult<u16> {
        let _ports = self.port_lock.lock().await;
        let taken = self.taken_ports(application_id).await?;
        let port = self.allocator.allocate(application_id, &taken)?;

        self.sandboxes
            .update_sandbox(application_id, SandboxUpdate::default().port(Some(port)))
            .await?;
        self.applications
            .update_application(application_id, ApplicationUpdate::new().port(Some(port)))
            .await?;

        info!("Allocated port {} for application {}", port, application_id);
        Ok(port)
    }

    /// Recorded port, else the engine's live binding, else a fresh allocation.
    pub async fn get_or_allocate_port(&self, application_id: &str) -> CoreResult<u16> {
        let record = self.sandboxes.get_sandbox(application_id).await?;

        if let Some(port) = record.as_ref().and_then(|r| r.port) {
            return Ok(port);
        }

        let Some(record) = record else {
            if let Some(port) = self
                .applications
                .get_application(application_id)
                .await?
                .and_then(|a| a.port)
            {
                return Ok(port);
            }
            return self.allocate_port(application_id).await;
        };

        if let Some(port) = self
            .runtime
            .port_mapping(&record.handle, self.settings.internal_port)
            .await?
        {
            self.sandboxes
                .update_sandbox(application_id, SandboxUpdate::default().port(Some(port)))
                .await?;
            self.applications
                .update_application(application_id, ApplicationUpdate::new().port(Some(port)))
                .await?;
            info!(
                "Recovered port {} from sandbox {}",
                port,
                short_handle(&record.handle)
            );
            return Ok(port);
        }

        let port = self.allocate_port(application_id).await?;
        warn!(
            "Sandbox {} has no port mapping; allocated {} but the preview may not work until the sandbox is recreated",
            short_handle(&record.handle),
            port
        );
        Ok(port)
    }

    /// Write the task descriptor into the application's sandbox.
    pub async fn write_task_descriptor(
        &self,
        application_id: &str,
        requirements: &str,
    ) -> CoreResult<()> {
        let record = self.get_or_create(application_id).await?;
        let path = self.task_descriptor_path();
        self.runtime
            .write_file(&record.handle, &path, &render_task_descriptor(requirements))
            .await?;
        info!("Wrote {} for application {}", path, application_id);
        Ok(())
    }

    pub fn task_descriptor_path(&self) -> String {
        format!(
            "{}/{}",
            self.settings.workdir.trim_end_matches('/'),
            TASK_DESCRIPTOR_FILE
        )
    }

    /// Stop the sandbox without removing it.
    pub async fn stop(&self, application_id: &str) -> CoreResult<()> {
        let _guard = self.locks.lock(application_id).await;
        let record = self
            .sandboxes
            .get_sandbox(application_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Sandbox for application", application_id))?;

        match self
            .runtime
            .stop(&record.handle, self.settings.stop_timeout())
            .await
        {
            Ok(()) => {}
            Err(RunnerError::NotFound(_)) => {
                warn!("Sandbox {} was already gone", short_handle(&record.handle));
            }
            Err(e) => return Err(e.into()),
        }

        self.sandboxes
            .update_sandbox(application_id, SandboxUpdate::status(SandboxStatus::Stopped))
            .await?;

        if let Some(app) = self.applications.get_application(application_id).await? {
            if app.status == ApplicationStatus::Running {
                self.applications
                    .update_application(
                        application_id,
                        ApplicationUpdate::new().status(ApplicationStatus::Stopped),
                    )
                    .await?;
            }
        }

        info!("Stopped sandbox {} for {}", short_handle(&record.handle), application_id);
        Ok(())
    }

    /// Remove the sandbox and its record. Already-removed sandboxes are not an error.
    pub async fn delete(&self, application_id: &str) -> CoreResult<()> {
        let _guard = self.locks.lock(application_id).await;
        let Some(record) = self.sandboxes.get_sandbox(application_id).await? else {
            debug!("No sandbox recorded for {}", application_id);
            return Ok(());
        };

        self.teardown_locked(&record).await?;
        if self.applications.get_application(application_id).await?.is_some() {
            self.applications
                .update_application(
                    application_id,
                    ApplicationUpdate::new()
                        .sandbox_handle(None)
                        .preview_url(None),
                )
                .await?;
        }

        info!("Deleted sandbox {} for {}", short_handle(&record.handle), application_id);
        Ok(())
    }

    /// Delete an application together with its sandbox.
    pub async fn delete_application(&self, application_id: &str) -> CoreResult<()> {
        self.application(application_id).await?;
        self.delete(application_id).await?;
        self.applications.delete_application(application_id).await?;
        info!("Deleted application {}", application_id);
        Ok(())
    }

    /// Run a shell command in the application's working directory.
    pub async fn exec(&self, application_id: &str, command: &str) -> CoreResult<ExecOutput> {
        let record = self.get_or_create(application_id).await?;
        Ok(self
            .runtime
            .exec(&record.handle, command, &self.settings.workdir)
            .await?)
    }

    pub async fn write_file(&self, application_id: &str, path: &str, content: &str) -> CoreResult<()> {
        let record = self.get_or_create(application_id).await?;
        Ok(self.runtime.write_file(&record.handle, path, content).await?)
    }

    pub async fn read_file(&self, application_id: &str, path: &str) -> CoreResult<Option<String>> {
        let record = self.get_or_create(application_id).await?;
        Ok(self.runtime.read_file(&record.handle, path).await?)
    }

    /// Recursive file tree under `root`, or the working directory.
    pub async fn file_tree(
        &self,
        application_id: &str,
        root: Option<&str>,
    ) -> CoreResult<Vec<FileNode>> {
        let record = self.get_or_create(application_id).await?;
        let root = root.unwrap_or(&self.settings.workdir);
        Ok(file_tree(self.runtime.as_ref(), &record.handle, root, DEFAULT_TREE_DEPTH).await)
    }
}

// Container names allow [a-zA-Z0-9_.-]
fn name_fragment(application_id: &str) -> String {
    application_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase()
}
