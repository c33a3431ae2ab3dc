//! Configuration loaded from `.kiln/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_runner::ResourceLimits;
use kiln_templates::ServerKind;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Directory holding kiln configuration and data.
pub const KILN_DIR: &str = ".kiln";
const CONFIG_FILE: &str = "config.toml";

/// Top-level kiln configuration.
///
/// Every key is optional in the file; missing keys keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub sandbox: SandboxSettings,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
    pub llm: LlmSettings,
}

/// Sandbox provisioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_cores: f64,
    /// Port the generated app's server listens on inside the sandbox
    pub internal_port: u16,
    pub workdir: String,
    /// First host port of the allocation pool (inclusive)
    pub port_range_start: u16,
    /// Last host port of the allocation pool (inclusive)
    pub port_range_end: u16,
    pub pull_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Host name used in preview addresses
    pub preview_host: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "node:18-alpine".to_string(),
            memory_mb: 512,
            cpu_cores: 0.5,
            internal_port: 8000,
            workdir: "/app".to_string(),
            port_range_start: 5000,
            port_range_end: 9000,
            pull_timeout_secs: 300,
            stop_timeout_secs: 10,
            preview_host: "localhost".to_string(),
        }
    }
}

impl SandboxSettings {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits::new(self.memory_mb, self.cpu_cores)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Externally reachable address for a host port.
    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.preview_host, port)
    }
}

/// Generation pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub static_settle_ms: u64,
    pub dev_server_settle_ms: u64,
    /// Server log lines included in verification output
    pub log_tail_lines: usize,
    /// Requirement characters shown in generated pages
    pub excerpt_chars: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            static_settle_ms: 2000,
            dev_server_settle_ms: 3000,
            log_tail_lines: 15,
            excerpt_chars: 100,
        }
    }
}

impl PipelineSettings {
    /// How long to wait after starting a server before probing it.
    pub fn settle_delay(&self, kind: ServerKind) -> Duration {
        match kind {
            ServerKind::StaticFiles => Duration::from_millis(self.static_settle_ms),
            ServerKind::DevServer => Duration::from_millis(self.dev_server_settle_ms),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory, relative to the workspace root unless absolute
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(KILN_DIR).join("data"),
        }
    }
}

/// Classification model settings. Credentials always come from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// `openai` or `anthropic`; detected from available keys when unset
    pub provider: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            max_tokens: 1024,
            temperature: 0.3,
        }
    }
}

impl KilnConfig {
    /// Path of the config file under a workspace root.
    pub fn path(root: &Path) -> PathBuf {
        root.join(KILN_DIR).join(CONFIG_FILE)
    }

    /// Load configuration from `.kiln/config.toml` under `root`.
    /// Returns defaults if the file doesn't exist.
    pub fn load(root: &Path) -> CoreResult<Self> {
        let config_path = Self::path(root);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            CoreError::Config(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            CoreError::Config(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let sandbox = &self.sandbox;
        if sandbox.port_range_start == 0 || sandbox.port_range_start > sandbox.port_range_end {
            return Err(CoreError::Config(format!(
                "invalid port range {}-{}",
                sandbox.port_range_start, sandbox.port_range_end
            )));
        }
        if sandbox.cpu_cores <= 0.0 || sandbox.memory_mb == 0 {
            return Err(CoreError::Config(
                "sandbox memory and cpu limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Data directory resolved against the workspace root.
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        if self.storage.data_dir.is_absolute() {
            self.storage.data_dir.clone()
        } else {
            root.join(&self.storage.data_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_config_defaults() {
        let config = KilnConfig::default();
        assert_eq!(config.sandbox.image, "node:18-alpine");
        assert_eq!(config.sandbox.internal_port, 8000);
        assert_eq!(config.sandbox.limits().memory_mb, 512);
        assert_eq!(config.pipeline.log_tail_lines, 15);
        assert_eq!(
            config.pipeline.settle_delay(ServerKind::DevServer),
            Duration::from_secs(3)
        );
        assert_eq!(config.sandbox.preview_url(6123), "http://localhost:6123");
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = KilnConfig::load(dir.path()).unwrap();
        assert_eq!(config, KilnConfig::default());
        assert_eq!(config.data_dir(dir.path()), dir.path().join(".kiln/data"));
    }

    #[test]
    fn test_config_load_partial() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(KILN_DIR)).unwrap();
        fs::write(
            KilnConfig::path(dir.path()),
            r#"
[sandbox]
image = "node:20-alpine"
port_range_start = 6000

[pipeline]
static_settle_ms = 500
"#,
        )
        .unwrap();

        let config = KilnConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.image, "node:20-alpine");
        assert_eq!(config.sandbox.port_range_start, 6000);
        assert_eq!(config.sandbox.port_range_end, 9000);
        assert_eq!(config.pipeline.static_settle_ms, 500);
        assert_eq!(config.pipeline.dev_server_settle_ms, 3000);
    }

    #[test]
    fn test_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(KILN_DIR)).unwrap();
        fs::write(KilnConfig::path(dir.path()), "[sandbox]\nmemory_mb = \"lots\"\n").unwrap();
        assert!(KilnConfig::load(dir.path()).is_err());

        fs::write(
            KilnConfig::path(dir.path()),
            "[sandbox]\nport_range_start = 9000\nport_range_end = 5000\n",
        )
        .unwrap();
        assert!(matches!(
            KilnConfig::load(dir.path()),
            Err(CoreError::Config(_))
        ));
    }
}
