//! Sandbox configuration types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource ceilings applied to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes
    pub memory_mb: u64,
    /// CPU share in cores (0.5 = half a core)
    pub cpu_cores: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 0.5,
        }
    }
}

impl ResourceLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
        }
    }

    /// Memory ceiling in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb as i64) * 1024 * 1024
    }

    /// CPU share in the engine's nano-CPU unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0) as i64
    }
}

/// Everything the engine needs to provision a long-lived sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Base image reference (e.g. `node:18-alpine`)
    pub image: String,
    /// Container name prefix; a short random suffix is appended
    pub name_prefix: String,
    /// Resource ceilings
    pub limits: ResourceLimits,
    /// Requested bindings, container port -> host port
    pub ports: BTreeMap<u16, u16>,
    /// Command that keeps the sandbox alive between execs
    pub keep_alive: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
}

impl SandboxSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name_prefix: "kiln".to_string(),
            limits: ResourceLimits::default(),
            ports: BTreeMap::new(),
            keep_alive: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
            env: BTreeMap::new(),
        }
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Bind `container_port` to `host_port` on the host.
    pub fn port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, host_port);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Image reference with an explicit tag (`latest` when none given).
    pub fn image_with_tag(&self) -> String {
        let last_segment = self.image.rsplit('/').next().unwrap_or(&self.image);
        if last_segment.contains(':') || self.image.contains('@') {
            self.image.clone()
        } else {
            format!("{}:latest", self.image)
        }
    }
}
