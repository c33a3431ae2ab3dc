//! Docker implementation of SandboxRuntime.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SandboxSpec;
use crate::error::{RunnerError, RunnerResult};
use crate::listing::parse_ls_output;
use crate::runner::{short_handle, DirEntry, ExecOutput, SandboxRuntime, SandboxState};

/// Default upper bound for an on-demand image pull.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Docker-based sandbox runtime.
pub struct DockerRuntime {
    client: Docker,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub async fn connect() -> RunnerResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::Unavailable(e.to_string()))?;

        // Verify connection
        client
            .ping()
            .await
            .map_err(|e| RunnerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        })
    }

    /// Connect to a Docker daemon over HTTP.
    pub async fn with_host(host: &str) -> RunnerResult<Self> {
        let client = Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| RunnerError::Unavailable(e.to_string()))?;
        client
            .ping()
            .await
            .map_err(|e| RunnerError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        })
    }

    pub fn with_pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    fn generate_container_name(prefix: &str) -> String {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        format!("{}-{}", prefix, id)
    }

    async fn image_exists(&self, image: &str) -> RunnerResult<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RunnerError::from_docker(e, image)),
        }
    }

    async fn pull_image(&self, image: &str) -> RunnerResult<()> {
        info!("Pulling image {}", image);

        let pull = async {
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };
            let mut stream = self.client.create_image(Some(options), None, None);

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            debug!("Pull status: {}", status);
                        }
                    }
                    Err(e) => return Err(RunnerError::ImagePullFailed(e.to_string())),
                }
            }
            Ok(())
        };

        match timeout(self.pull_timeout, pull).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RunnerError::PullTimeout {
                    image: image.to_string(),
                    seconds: self.pull_timeout.as_secs(),
                })
            }
        }

        info!("Image {} pulled successfully", image);
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> RunnerResult<bollard::service::ContainerInspectResponse> {
        self.client
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))
    }
}

/// Pack a single text file into an in-memory tar archive.
fn build_single_file_tar(file_name: &str, content: &str) -> RunnerResult<Vec<u8>> {
    let bytes = content.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, bytes)
        .map_err(|e| RunnerError::Archive(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| RunnerError::Archive(e.to_string()))
}

/// Extract the first regular file of a tar archive as text.
fn read_first_tar_entry(archive: &[u8]) -> RunnerResult<Option<String>> {
    let mut archive = tar::Archive::new(archive);
    let entries = archive
        .entries()
        .map_err(|e| RunnerError::Archive(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| RunnerError::Archive(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut raw = Vec::new();
        entry
            .read_to_end(&mut raw)
            .map_err(|e| RunnerError::Archive(e.to_string()))?;
        return Ok(Some(String::from_utf8_lossy(&raw).into_owned()));
    }

    Ok(None)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> RunnerResult<String> {
        let full_image = spec.image_with_tag();
        let container_name = Self::generate_container_name(&spec.name_prefix);

        debug!("Creating sandbox {} with image {}", container_name, full_image);

        // Pull image if needed
        if !self.image_exists(&full_image).await? {
            self.pull_image(&full_image).await?;
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            let key = format!("{}/tcp", container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes()),
            nano_cpus: Some(spec.limits.nano_cpus()),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(full_image.clone()),
            cmd: Some(spec.keep_alive.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| RunnerError::from_docker(e, &container_name))?;

        for warning in &container.warnings {
            warn!("Engine warning for {}: {}", container_name, warning);
        }

        info!(
            "Created sandbox {} ({})",
            container_name,
            short_handle(&container.id)
        );
        Ok(container.id)
    }

    async fn start(&self, handle: &str) -> RunnerResult<()> {
        self.client
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))?;
        debug!("Started sandbox {}", short_handle(handle));
        Ok(())
    }

    async fn stop(&self, handle: &str, timeout: Duration) -> RunnerResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.client.stop_container(handle, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(RunnerError::from_docker(e, handle)),
        }
    }

    async fn remove(&self, handle: &str, force: bool) -> RunnerResult<()> {
        self.client
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))
    }

    async fn exec(&self, handle: &str, command: &str, workdir: &str) -> RunnerResult<ExecOutput> {
        debug!("exec in {}: {}", short_handle(handle), command);

        let options = CreateExecOptions {
            cmd: Some(vec!["sh", "-c", command]),
            working_dir: Some(workdir),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(handle, options)
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(RunnerError::ExecutionFailed(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RunnerError::ExecutionFailed(
                    "exec started detached".to_string(),
                ))
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))?;

        // An exec without a reported exit code did not finish normally
        let exit_code = inspect.exit_code.unwrap_or(-1);

        stdout.push_str(&stderr);
        Ok(ExecOutput::new(exit_code, stdout))
    }

    async fn write_file(&self, handle: &str, path: &str, content: &str) -> RunnerResult<()> {
        let target = Path::new(path);
        let parent = target
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunnerError::Archive(format!("invalid file path: {}", path)))?;

        let mkdir = self
            .exec(handle, &format!("mkdir -p {}", shell_quote(&parent)), "/")
            .await?;
        if !mkdir.success() {
            return Err(RunnerError::ExecutionFailed(format!(
                "could not create {}: {}",
                parent,
                mkdir.output.trim()
            )));
        }

        let archive = build_single_file_tar(&file_name, content)?;
        let options = UploadToContainerOptions {
            path: parent.as_str(),
            ..Default::default()
        };

        self.client
            .upload_to_container(handle, Some(options), archive.into())
            .await
            .map_err(|e| RunnerError::from_docker(e, handle))?;

        debug!("Wrote {} ({} bytes) to {}", path, content.len(), short_handle(handle));
        Ok(())
    }

    async fn read_file(&self, handle: &str, path: &str) -> RunnerResult<Option<String>> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = self.client.download_from_container(handle, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    // Distinguish a missing file from a missing sandbox
                    self.inspect(handle).await?;
                    return Ok(None);
                }
                Err(e) => return Err(RunnerError::from_docker(e, handle)),
            }
        }

        read_first_tar_entry(&archive)
    }

    async fn list_directory(&self, handle: &str, path: &str) -> RunnerResult<Vec<DirEntry>> {
        let output = self
            .exec(handle, &format!("ls -lA {}", shell_quote(path)), "/")
            .await?;
        if !output.success() {
            debug!("ls failed for {}: {}", path, output.output.trim());
            return Ok(Vec::new());
        }
        Ok(parse_ls_output(&output.output))
    }

    async fn port_mapping(&self, handle: &str, container_port: u16) -> RunnerResult<Option<u16>> {
        let info = self.inspect(handle).await?;
        let key = format!("{}/tcp", container_port);

        let host_port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()))
            });

        Ok(host_port)
    }

    async fn status(&self, handle: &str) -> RunnerResult<SandboxState> {
        let info = self.inspect(handle).await?;
        let status = info.state.and_then(|state| state.status);

        Ok(match status {
            Some(ContainerStateStatusEnum::CREATED) => SandboxState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => SandboxState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => SandboxState::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => SandboxState::Restarting,
            Some(ContainerStateStatusEnum::EXITED) => SandboxState::Exited,
            Some(ContainerStateStatusEnum::DEAD) | Some(ContainerStateStatusEnum::REMOVING) => {
                SandboxState::Dead
            }
            _ => SandboxState::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_round_trip() {
        let archive = build_single_file_tar("task.md", "# Task\n").unwrap();
        let content = read_first_tar_entry(&archive).unwrap();
        assert_eq!(content.as_deref(), Some("# Task\n"));
    }

    #[test]
    fn test_empty_archive_reads_none() {
        let archive = tar::Builder::new(Vec::new()).into_inner().unwrap();
        assert_eq!(read_first_tar_entry(&archive).unwrap(), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/app/src"), "'/app/src'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_container_name_has_prefix() {
        let name = DockerRuntime::generate_container_name("kiln");
        assert!(name.starts_with("kiln-"));
        assert_eq!(name.len(), "kiln-".len() + 8);
    }
}
