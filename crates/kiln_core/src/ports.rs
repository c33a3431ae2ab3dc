//! Host port allocation from a bounded pool.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::TcpListener;

use tracing::debug;

use crate::config::SandboxSettings;
use crate::error::{CoreError, CoreResult};

/// Chooses host ports in `[start, end]`.
///
/// The scan starts at an offset derived from the application id so that
/// concurrent applications rarely probe the same ports, then wraps around.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: start.min(end),
            end: end.max(start),
            probe_host: true,
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(settings.port_range_start, settings.port_range_end)
    }

    /// Skip the host bind check; only recorded ports are avoided.
    pub fn without_host_probe(mut self) -> Self {
        self.probe_host = false;
        self
    }

    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Pick a port not in `taken` that the host can currently bind.
    pub fn allocate(&self, application_id: &str, taken: &HashSet<u16>) -> CoreResult<u16> {
        let capacity = self.capacity();
        let offset = (Self::seed(application_id) % capacity as u64) as usize;

        for i in 0..capacity {
            let port = self.start + ((offset + i) % capacity) as u16;
            if taken.contains(&port) {
                continue;
            }
            if self.probe_host && !host_port_free(port) {
                debug!("Port {} is busy on the host", port);
                continue;
            }
            return Ok(port);
        }

        Err(CoreError::ResourceExhausted(format!(
            "no free host port in {}-{}",
            self.start, self.end
        )))
    }

    fn seed(application_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        application_id.hash(&mut hasher);
        hasher.finish()
    }
}

fn host_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
