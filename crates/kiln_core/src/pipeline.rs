//! Generation pipeline: requirements in, running preview out.
//!
//! The pipeline runs five phases against the application's sandbox:
//!
//! 1. classify the project type from the requirements text
//! 2. materialize the template (directories, files, dependency install)
//! 3. start the HTTP server in the background
//! 4. verify the server (advisory only)
//! 5. reconcile the host port and persist the preview address
//!
//! Any error aborts the run, moves the application to `error` and is
//! reported as a single `error` event before the terminal marker.

use std::sync::Arc;

use kiln_runner::{short_handle, ExecOutput};
use kiln_templates::{classify_project, ProjectTemplate, RenderedProject, TemplateContext};
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventEmitter, ProgressStream, ToolInvocation, ToolOutcome};
use crate::lifecycle::LifecycleManager;
use crate::models::{ApplicationStatus, ApplicationUpdate};

const LOG_PREVIEW_CHARS: usize = 200;

/// Drives template generation and deployment for one application at a time.
#[derive(Clone)]
pub struct GenerationPipeline {
    lifecycle: Arc<LifecycleManager>,
    settings: PipelineSettings,
}

impl GenerationPipeline {
    pub fn new(lifecycle: Arc<LifecycleManager>, settings: PipelineSettings) -> Self {
        Self {
            lifecycle,
            settings,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Generate and deploy the application, streaming progress.
    pub fn generate_and_deploy(&self, application_id: &str, requirements: &str) -> ProgressStream {
        let pipeline = self.clone();
        let application_id = application_id.to_string();
        let requirements = requirements.to_string();

        ProgressStream::spawn(move |mut emitter| async move {
            let result = pipeline
                .run(&application_id, &requirements, &mut emitter)
                .await;
            if let Err(e) = &result {
                pipeline.mark_failed(&application_id, e).await;
            }
            result
        })
    }

    async fn run(
        &self,
        application_id: &str,
        requirements: &str,
        emitter: &mut EventEmitter,
    ) -> CoreResult<()> {
        if requirements.trim().is_empty() {
            return Err(CoreError::InvalidState(format!(
                "application {} has no requirements to generate from",
                application_id
            )));
        }

        let app = self.lifecycle.application(application_id).await?;
        info!("Generating application {} ({})", app.id, app.name);
        emitter
            .text("Starting code generation for your application...")
            .await?;
        self.set_status(application_id, ApplicationStatus::Generating)
            .await?;

        match self.lifecycle.sandbox(application_id).await? {
            Some(record) => {
                emitter
                    .thought(format!(
                        "Reusing sandbox {} for this application.",
                        short_handle(&record.handle)
                    ))
                    .await?
            }
            None => emitter.thought("Creating a sandbox for your application...").await?,
        }
        let sandbox = self.lifecycle.get_or_create(application_id).await?;
        let handle = sandbox.handle;
        self.set_status(application_id, ApplicationStatus::Deploying)
            .await?;
        let host_port = self.lifecycle.get_or_allocate_port(application_id).await?;
        debug!(
            "Application {} uses sandbox {} on host port {}",
            application_id,
            short_handle(&handle),
            host_port
        );

        // Phase 1
        emitter.thought("Analyzing requirements...").await?;
        let project_type = classify_project(requirements);
        info!("Application {} classified as {}", application_id, project_type);
        emitter
            .text(format!(
                "Creating a {} application based on your requirements.",
                project_type.label()
            ))
            .await?;

        // Phase 2
        let sandbox_settings = self.lifecycle.settings();
        let context = TemplateContext::new(requirements, sandbox_settings.internal_port)
            .title(app.name.clone())
            .workdir(sandbox_settings.workdir.clone())
            .excerpt_chars(self.settings.excerpt_chars);
        let project = ProjectTemplate::for_type(project_type).render(&context)?;
        self.materialize(&handle, &project, emitter).await?;

        // Phase 3
        self.start_server(&handle, &project, emitter).await?;

        // Phase 4
        self.verify(&handle, &project, emitter).await?;

        // Phase 5
        let internal_port = sandbox_settings.internal_port;
        let port = match self
            .lifecycle
            .runtime()
            .port_mapping(&handle, internal_port)
            .await?
        {
            Some(actual) if actual != host_port => {
                warn!(
                    "Application {} port drifted from {} to {}",
                    application_id, host_port, actual
                );
                actual
            }
            Some(actual) => actual,
            None => host_port,
        };
        let preview_url = self.lifecycle.preview_url(port);
        self.lifecycle
            .applications()
            .update_application(
                application_id,
                ApplicationUpdate::new()
                    .status(ApplicationStatus::Running)
                    .sandbox_handle(Some(handle.clone()))
                    .port(Some(port))
                    .preview_url(Some(preview_url.clone())),
            )
            .await?
            .ok_or_else(|| CoreError::not_found("Application", application_id))?;

        info!("Application {} running at {}", application_id, preview_url);
        emitter
            .text(format!(
                "Code generation complete! Your application is running at {}",
                preview_url
            ))
            .await?;
        Ok(())
    }

    async fn materialize(
        &self,
        handle: &str,
        project: &RenderedProject,
        emitter: &mut EventEmitter,
    ) -> CoreResult<()> {
        let runtime = self.lifecycle.runtime();
        let workdir = &self.lifecycle.settings().workdir;

        if !project.directories.is_empty() {
            let invocation = ToolInvocation::CreateDirectory {
                paths: project.directories.clone(),
            };
            let tool = invocation.name();
            emitter.tool_call(invocation).await?;
            let output = runtime
                .exec(handle, &format!("mkdir -p {}", project.directories.join(" ")), "/")
                .await?;
            emitter.tool_result(tool, ToolOutcome::from(&output)).await?;
            if !output.success() {
                return Err(CoreError::Sandbox(format!(
                    "could not create project directories: {}",
                    output.output.trim()
                )));
            }
        }

        for file in &project.files {
            let invocation = ToolInvocation::CreateFile {
                path: file.path.clone(),
                purpose: file.purpose.clone(),
            };
            let tool = invocation.name();
            emitter.tool_call(invocation).await?;
            if let Err(e) = runtime.write_file(handle, &file.path, &file.content).await {
                emitter
                    .tool_result(tool, ToolOutcome::failed(e.to_string()))
                    .await?;
                return Err(e.into());
            }
            emitter
                .tool_result(
                    tool,
                    ToolOutcome {
                        success: true,
                        exit_code: None,
                        output: format!("Wrote {} bytes to {}", file.content.len(), file.path),
                    },
                )
                .await?;
        }

        if let Some(install) = &project.install {
            let invocation = ToolInvocation::InstallDependencies {
                package_manager: install.package_manager.to_string(),
            };
            let tool = invocation.name();
            emitter.tool_call(invocation).await?;
            emitter
                .text("Installing dependencies (this may take a minute)...")
                .await?;
            let output = runtime.exec(handle, install.command, workdir).await?;
            emitter.tool_result(tool, ToolOutcome::from(&output)).await?;

            if !output.success() {
                let failure = CoreError::PartialStepFailure {
                    step: tool.to_string(),
                    message: format!("{} exited with code {}", install.command, output.exit_code),
                };
                warn!("{}", failure);
                emitter
                    .text(format!("Warning: {}. Continuing with deployment.", failure))
                    .await?;
            }
        }

        Ok(())
    }

    async fn start_server(
        &self,
        handle: &str,
        project: &RenderedProject,
        emitter: &mut EventEmitter,
    ) -> CoreResult<()> {
        let runtime = self.lifecycle.runtime();
        let server = &project.server;

        for support in &server.support_files {
            debug!("Writing {} ({})", support.path, support.purpose);
            runtime
                .write_file(handle, &support.path, &support.content)
                .await?;
        }

        // One server per sandbox: stop the one a previous run left behind
        let stopped = runtime.exec(handle, &server.stop_command(), "/").await?;
        debug!(
            "Previous server stop in sandbox {} exited with {}",
            short_handle(handle),
            stopped.exit_code
        );

        let invocation = ToolInvocation::StartServer {
            command: server.command.clone(),
        };
        let tool = invocation.name();
        emitter.tool_call(invocation).await?;
        let output = runtime.exec(handle, &server.command, "/").await?;
        emitter.tool_result(tool, ToolOutcome::from(&output)).await?;

        if !output.success() {
            warn!(
                "{} start command exited with {} in sandbox {}",
                server.kind.label(),
                output.exit_code,
                short_handle(handle)
            );
        }
        Ok(())
    }

    async fn verify(
        &self,
        handle: &str,
        project: &RenderedProject,
        emitter: &mut EventEmitter,
    ) -> CoreResult<()> {
        let runtime = self.lifecycle.runtime();
        let server = &project.server;

        emitter.thought("Waiting for the server to come up...").await?;
        tokio::time::sleep(self.settings.settle_delay(server.kind)).await;

        let pid = runtime.exec(handle, &server.pid_check_command(), "/").await?;
        let probe = runtime
            .exec(handle, &server.port_probe_command(), "/")
            .await?;
        let log = runtime
            .exec(handle, &server.log_tail_command(self.settings.log_tail_lines), "/")
            .await?;

        debug!("Server pid check: {}", pid.output.trim());
        debug!("Server log: {}", log.output.trim());

        if server_reachable(&probe) {
            emitter
                .text(format!(
                    "{} started successfully on port {}",
                    server.kind.label(),
                    server.port
                ))
                .await?;
        } else {
            let failure = CoreError::PartialStepFailure {
                step: "verify_server".to_string(),
                message: format!("port {} did not answer", server.port),
            };
            warn!("Sandbox {}: {}", short_handle(handle), failure);
            emitter
                .text(format!(
                    "{} start verification incomplete. Check the logs if the preview does not load.",
                    server.kind.label()
                ))
                .await?;
            emitter
                .text(format!(
                    "Log preview: {}",
                    log_preview(&log.output, LOG_PREVIEW_CHARS)
                ))
                .await?;
        }
        Ok(())
    }

    async fn set_status(&self, application_id: &str, status: ApplicationStatus) -> CoreResult<()> {
        self.lifecycle
            .applications()
            .update_application(application_id, ApplicationUpdate::new().status(status))
            .await?
            .ok_or_else(|| CoreError::not_found("Application", application_id))?;
        Ok(())
    }

    async fn mark_failed(&self, application_id: &str, cause: &CoreError) {
        if cause.is_not_found() && self.lifecycle.application(application_id).await.is_err() {
            return;
        }
        error!("Generation failed for {}: {}", application_id, cause);
        if let Err(e) = self.set_status(application_id, ApplicationStatus::Error).await {
            error!("Could not record failure for {}: {}", application_id, e);
        }
    }
}

fn server_reachable(probe: &ExecOutput) -> bool {
    probe.success() || probe.output.to_lowercase().contains("succeeded")
}

fn log_preview(log: &str, max_chars: usize) -> String {
    let trimmed = log.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
