//! Mock sandbox runtime for testing.
//!
//! Provides an in-memory implementation of the SandboxRuntime trait for use
//! in tests without requiring a container engine. Files written through the
//! runtime are kept per sandbox, so reads and listings observe earlier writes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::SandboxSpec;
use crate::error::{RunnerError, RunnerResult};
use crate::runner::{DirEntry, EntryKind, ExecOutput, SandboxRuntime, SandboxState};

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: String,
    pub handle: Option<String>,
    /// Command, path or image, depending on the method
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
struct MockSandbox {
    spec: SandboxSpec,
    state: SandboxState,
    files: BTreeMap<String, String>,
    dirs: BTreeSet<String>,
}

impl MockSandbox {
    fn new(spec: SandboxSpec) -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());
        Self {
            spec,
            state: SandboxState::Created,
            files: BTreeMap::new(),
            dirs,
        }
    }

    fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.dirs.insert(current.clone());
        }
    }
}

/// Mock sandbox runtime for testing.
///
/// This runtime captures all calls and simulates a container engine in
/// memory, allowing tests to verify lifecycle and pipeline behavior without
/// a Docker daemon.
#[derive(Clone)]
pub struct MockRuntime {
    sandboxes: Arc<RwLock<HashMap<String, MockSandbox>>>,
    /// Scripted exec results, matched by command substring in insertion order
    exec_rules: Arc<RwLock<Vec<(String, ExecOutput)>>>,
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
    /// When set, every call fails as if the engine were down.
    unavailable: Arc<RwLock<bool>>,
    /// Methods that fail with an engine error.
    failing_methods: Arc<RwLock<BTreeSet<String>>>,
    /// Host port reported instead of the requested binding.
    remapped_port: Arc<RwLock<Option<u16>>>,
    hide_port_mappings: Arc<RwLock<bool>>,
    create_delay: Arc<RwLock<Option<Duration>>>,
    next_id: Arc<AtomicUsize>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            sandboxes: Arc::new(RwLock::new(HashMap::new())),
            exec_rules: Arc::new(RwLock::new(Vec::new())),
            captured_calls: Arc::new(RwLock::new(Vec::new())),
            unavailable: Arc::new(RwLock::new(false)),
            failing_methods: Arc::new(RwLock::new(BTreeSet::new())),
            remapped_port: Arc::new(RwLock::new(None)),
            hide_port_mappings: Arc::new(RwLock::new(false)),
            create_delay: Arc::new(RwLock::new(None)),
            next_id: Arc::new(AtomicUsize::new(1)),
        }
    }

    /// Return `output` for any exec whose command contains `pattern`.
    pub fn on_exec(self, pattern: impl Into<String>, output: ExecOutput) -> Self {
        self.exec_rules.write().push((pattern.into(), output));
        self
    }

    /// Make every call fail as if the engine were unreachable.
    pub fn simulate_unavailable(self) -> Self {
        *self.unavailable.write() = true;
        self
    }

    /// Make calls to `method` fail with an engine error.
    pub fn fail_method(self, method: impl Into<String>) -> Self {
        self.failing_methods.write().insert(method.into());
        self
    }

    /// Report `host_port` for every port mapping, regardless of the request.
    pub fn remap_ports_to(self, host_port: u16) -> Self {
        *self.remapped_port.write() = Some(host_port);
        self
    }

    /// Report no port mappings at all.
    pub fn hide_port_mappings(self) -> Self {
        *self.hide_port_mappings.write() = true;
        self
    }

    /// Delay sandbox creation, widening race windows in concurrency tests.
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.create_delay.write() = Some(delay);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write() = unavailable;
    }

    /// Mark a sandbox as exited, as if its process had died.
    pub fn kill_sandbox(&self, handle: &str) {
        if let Some(sandbox) = self.sandboxes.write().get_mut(handle) {
            sandbox.state = SandboxState::Exited;
        }
    }

    /// Drop a sandbox without going through `remove`, leaving stale handles behind.
    pub fn forget_sandbox(&self, handle: &str) {
        self.sandboxes.write().remove(handle);
    }

    /// Number of sandboxes created so far.
    pub fn created_count(&self) -> usize {
        self.get_method_calls("create").len()
    }

    /// Handles of sandboxes that currently exist.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.sandboxes.read().keys().cloned().collect();
        handles.sort();
        handles
    }

    /// Spec a sandbox was created with.
    pub fn spec_of(&self, handle: &str) -> Option<SandboxSpec> {
        self.sandboxes.read().get(handle).map(|s| s.spec.clone())
    }

    /// Content of a file inside a sandbox.
    pub fn file(&self, handle: &str, path: &str) -> Option<String> {
        self.sandboxes
            .read()
            .get(handle)
            .and_then(|s| s.files.get(path).cloned())
    }

    /// Paths of all files inside a sandbox.
    pub fn file_paths(&self, handle: &str) -> Vec<String> {
        self.sandboxes
            .read()
            .get(handle)
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Check if a specific method was called.
    pub fn was_called(&self, method: &str) -> bool {
        self.captured_calls.read().iter().any(|c| c.method == method)
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Commands passed to `exec`, in call order.
    pub fn exec_commands(&self) -> Vec<String> {
        self.get_method_calls("exec")
            .into_iter()
            .filter_map(|c| c.detail)
            .collect()
    }

    fn record_call(&self, method: &str, handle: Option<&str>, detail: Option<&str>) {
        self.captured_calls.write().push(CapturedCall {
            method: method.to_string(),
            handle: handle.map(str::to_string),
            detail: detail.map(str::to_string),
        });
    }

    fn check_failure(&self, method: &str) -> RunnerResult<()> {
        if *self.unavailable.read() {
            return Err(RunnerError::Unavailable(
                "mock engine is unavailable".to_string(),
            ));
        }
        if self.failing_methods.read().contains(method) {
            return Err(RunnerError::Engine(format!("simulated {} failure", method)));
        }
        Ok(())
    }

    fn with_sandbox<T>(
        &self,
        handle: &str,
        f: impl FnOnce(&mut MockSandbox) -> T,
    ) -> RunnerResult<T> {
        let mut sandboxes = self.sandboxes.write();
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| RunnerError::NotFound(handle.to_string()))?;
        Ok(f(sandbox))
    }
}

fn resolve(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    };
    let trimmed = joined.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[async_trait]
impl SandboxRuntime for MockRuntime {
    async fn create(&self, spec: &SandboxSpec) -> RunnerResult<String> {
        self.record_call("create", None, Some(&spec.image));
        self.check_failure("create")?;

        let delay = *self.create_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = format!("mock-{:04}-{}", id, spec.name_prefix);
        self.sandboxes
            .write()
            .insert(handle.clone(), MockSandbox::new(spec.clone()));
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> RunnerResult<()> {
        self.record_call("start", Some(handle), None);
        self.check_failure("start")?;
        self.with_sandbox(handle, |s| s.state = SandboxState::Running)
    }

    async fn stop(&self, handle: &str, _timeout: Duration) -> RunnerResult<()> {
        self.record_call("stop", Some(handle), None);
        self.check_failure("stop")?;
        self.with_sandbox(handle, |s| s.state = SandboxState::Exited)
    }

    async fn remove(&self, handle: &str, _force: bool) -> RunnerResult<()> {
        self.record_call("remove", Some(handle), None);
        self.check_failure("remove")?;
        self.sandboxes
            .write()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RunnerError::NotFound(handle.to_string()))
    }

    async fn exec(&self, handle: &str, command: &str, workdir: &str) -> RunnerResult<ExecOutput> {
        self.record_call("exec", Some(handle), Some(command));
        self.check_failure("exec")?;

        let rule = self
            .exec_rules
            .read()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone());

        self.with_sandbox(handle, |sandbox| {
            if let Some(rest) = command.trim().strip_prefix("mkdir -p ") {
                for arg in rest.split_whitespace() {
                    let arg = arg.trim_matches(|c| c == '\'' || c == '"');
                    sandbox.add_dir(&resolve(workdir, arg));
                }
            }
            rule.unwrap_or_else(|| ExecOutput::new(0, ""))
        })
    }

    async fn write_file(&self, handle: &str, path: &str, content: &str) -> RunnerResult<()> {
        self.record_call("write_file", Some(handle), Some(path));
        self.check_failure("write_file")?;

        let path = resolve("/", path);
        self.with_sandbox(handle, |sandbox| {
            sandbox.add_dir(parent_of(&path));
            sandbox.files.insert(path, content.to_string());
        })
    }

    async fn read_file(&self, handle: &str, path: &str) -> RunnerResult<Option<String>> {
        self.record_call("read_file", Some(handle), Some(path));
        self.check_failure("read_file")?;

        let path = resolve("/", path);
        self.with_sandbox(handle, |sandbox| sandbox.files.get(&path).cloned())
    }

    async fn list_directory(&self, handle: &str, path: &str) -> RunnerResult<Vec<DirEntry>> {
        self.record_call("list_directory", Some(handle), Some(path));
        self.check_failure("list_directory")?;

        let dir = resolve("/", path);
        self.with_sandbox(handle, |sandbox| {
            let mut entries = Vec::new();
            for sub in &sandbox.dirs {
                if sub != &dir && parent_of(sub) == dir {
                    entries.push(DirEntry {
                        name: sub.rsplit('/').next().unwrap_or(sub).to_string(),
                        kind: EntryKind::Directory,
                        size: 0,
                        permissions: "drwxr-xr-x".to_string(),
                    });
                }
            }
            for (file, content) in &sandbox.files {
                if parent_of(file) == dir {
                    entries.push(DirEntry {
                        name: file.rsplit('/').next().unwrap_or(file).to_string(),
                        kind: EntryKind::File,
                        size: content.len() as u64,
                        permissions: "-rw-r--r--".to_string(),
                    });
                }
            }
            entries
        })
    }

    async fn port_mapping(&self, handle: &str, container_port: u16) -> RunnerResult<Option<u16>> {
        self.record_call("port_mapping", Some(handle), None);
        self.check_failure("port_mapping")?;

        let requested = self.with_sandbox(handle, |s| s.spec.ports.get(&container_port).copied())?;
        if *self.hide_port_mappings.read() {
            return Ok(None);
        }
        let remapped = *self.remapped_port.read();
        Ok(requested.and(remapped).or(requested))
    }

    async fn status(&self, handle: &str) -> RunnerResult<SandboxState> {
        self.record_call("status", Some(handle), None);
        self.check_failure("status")?;
        self.with_sandbox(handle, |s| s.state)
    }
}
