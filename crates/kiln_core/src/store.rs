//! Persistence for applications and sandbox records.
//!
//! Lookups return `Ok(None)` for missing records; updates return the
//! post-image, or `None` when the record does not exist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::models::{Application, ApplicationUpdate, SandboxRecord, SandboxUpdate};

/// Application record storage.
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn insert_application(&self, app: Application) -> CoreResult<Application>;

    async fn get_application(&self, id: &str) -> CoreResult<Option<Application>>;

    /// Find-and-update; returns the updated record.
    async fn update_application(
        &self,
        id: &str,
        update: ApplicationUpdate,
    ) -> CoreResult<Option<Application>>;

    /// Returns whether a record was removed.
    async fn delete_application(&self, id: &str) -> CoreResult<bool>;

    async fn list_applications(&self, owner_id: Option<&str>) -> CoreResult<Vec<Application>>;
}

/// Sandbox record storage, keyed by owning application id.
#[async_trait]
pub trait SandboxStore: Send + Sync {
    async fn get_sandbox(&self, application_id: &str) -> CoreResult<Option<SandboxRecord>>;

    /// Insert or replace the record for `record.application_id`.
    async fn put_sandbox(&self, record: SandboxRecord) -> CoreResult<SandboxRecord>;

    async fn update_sandbox(
        &self,
        application_id: &str,
        update: SandboxUpdate,
    ) -> CoreResult<Option<SandboxRecord>>;

    async fn delete_sandbox(&self, application_id: &str) -> CoreResult<bool>;

    /// Host ports held by any sandbox record.
    async fn recorded_ports(&self) -> CoreResult<Vec<u16>>;
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct MemoryStore {
    applications: RwLock<HashMap<String, Application>>,
    sandboxes: RwLock<HashMap<String, SandboxRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn insert_application(&self, app: Application) -> CoreResult<Application> {
        let mut apps = self.applications.write();
        if apps.contains_key(&app.id) {
            return Err(CoreError::Storage(format!("application {} already exists", app.id)));
        }
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn get_application(&self, id: &str) -> CoreResult<Option<Application>> {
        Ok(self.applications.read().get(id).cloned())
    }

    async fn update_application(
        &self,
        id: &str,
        update: ApplicationUpdate,
    ) -> CoreResult<Option<Application>> {
        let mut apps = self.applications.write();
        let Some(app) = apps.get_mut(id) else {
            return Ok(None);
        };
        let mut next = app.clone();
        update.apply(&mut next)?;
        *app = next.clone();
        Ok(Some(next))
    }

    async fn delete_application(&self, id: &str) -> CoreResult<bool> {
        Ok(self.applications.write().remove(id).is_some())
    }

    async fn list_applications(&self, owner_id: Option<&str>) -> CoreResult<Vec<Application>> {
        let mut apps: Vec<Application> = self
            .applications
            .read()
            .values()
            .filter(|a| owner_id.map_or(true, |o| a.owner_id == o))
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }
}

#[async_trait]
impl SandboxStore for MemoryStore {
    async fn get_sandbox(&self, application_id: &str) -> CoreResult<Option<SandboxRecord>> {
        Ok(self.sandboxes.read().get(application_id).cloned())
    }

    async fn put_sandbox(&self, record: SandboxRecord) -> CoreResult<SandboxRecord> {
        self.sandboxes
            .write()
            .insert(record.application_id.clone(), record.clone());
        Ok(record)
    }

    async fn update_sandbox(
        &self,
        application_id: &str,
        update: SandboxUpdate,
    ) -> CoreResult<Option<SandboxRecord>> {
        let mut sandboxes = self.sandboxes.write();
        Ok(sandboxes.get_mut(application_id).map(|record| {
            update.apply(record);
            record.clone()
        }))
    }

    async fn delete_sandbox(&self, application_id: &str) -> CoreResult<bool> {
        Ok(self.sandboxes.write().remove(application_id).is_some())
    }

    async fn recorded_ports(&self) -> CoreResult<Vec<u16>> {
        Ok(self.sandboxes.read().values().filter_map(|r| r.port).collect())
    }
}

/// File-backed store writing one pretty-printed JSON document per record.
///
/// Layout: `<root>/applications/<id>.json` and `<root>/sandboxes/<application_id>.json`.
pub struct JsonStore {
    root: PathBuf,
    // Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Open a store rooted at `root`, creating its directories.
    pub async fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("applications")).await?;
        tokio::fs::create_dir_all(root.join("sandboxes")).await?;
        debug!("Opened JSON store at {:?}", root);
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: &str, id: &str) -> CoreResult<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(CoreError::Storage(format!("invalid record id: {:?}", id)));
        }
        Ok(self.root.join(kind).join(format!("{}.json", id)))
    }

    async fn read_record<T: serde::de::DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record<T: serde::Serialize>(path: &Path, record: &T) -> CoreResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        // Write then rename so readers never observe a partial document
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn remove_record(path: &Path) -> CoreResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all<T: serde::de::DeserializeOwned>(&self, kind: &str) -> CoreResult<Vec<T>> {
        let mut records = Vec::new();
        let mut dir = tokio::fs::read_dir(self.root.join(kind)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl ApplicationStore for JsonStore {
    async fn insert_application(&self, app: Application) -> CoreResult<Application> {
        let path = self.record_path("applications", &app.id)?;
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(CoreError::Storage(format!("application {} already exists", app.id)));
        }
        Self::write_record(&path, &app).await?;
        Ok(app)
    }

    async fn get_application(&self, id: &str) -> CoreResult<Option<Application>> {
        Self::read_record(&self.record_path("applications", id)?).await
    }

    async fn update_application(
        &self,
        id: &str,
        update: ApplicationUpdate,
    ) -> CoreResult<Option<Application>> {
        let path = self.record_path("applications", id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut app) = Self::read_record::<Application>(&path).await? else {
            return Ok(None);
        };
        update.apply(&mut app)?;
        Self::write_record(&path, &app).await?;
        Ok(Some(app))
    }

    async fn delete_application(&self, id: &str) -> CoreResult<bool> {
        let path = self.record_path("applications", id)?;
        let _guard = self.write_lock.lock().await;
        Self::remove_record(&path).await
    }

    async fn list_applications(&self, owner_id: Option<&str>) -> CoreResult<Vec<Application>> {
        let mut apps: Vec<Application> = self
            .read_all::<Application>("applications")
            .await?
            .into_iter()
            .filter(|a| owner_id.map_or(true, |o| a.owner_id == o))
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }
}

#[async_trait]
impl SandboxStore for JsonStore {
    async fn get_sandbox(&self, application_id: &str) -> CoreResult<Option<SandboxRecord>> {
        Self::read_record(&self.record_path("sandboxes", application_id)?).await
    }

    async fn put_sandbox(&self, record: SandboxRecord) -> CoreResult<SandboxRecord> {
        let path = self.record_path("sandboxes", &record.application_id)?;
        let _guard = self.write_lock.lock().await;
        Self::write_record(&path, &record).await?;
        Ok(record)
    }

    async fn update_sandbox(
        &self,
        application_id: &str,
        update: SandboxUpdate,
    ) -> CoreResult<Option<SandboxRecord>> {
        let path = self.record_path("sandboxes", application_id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = Self::read_record::<SandboxRecord>(&path).await? else {
            return Ok(None);
        };
        update.apply(&mut record);
        Self::write_record(&path, &record).await?;
        Ok(Some(record))
    }

    async fn delete_sandbox(&self, application_id: &str) -> CoreResult<bool> {
        let path = self.record_path("sandboxes", application_id)?;
        let _guard = self.write_lock.lock().await;
        Self::remove_record(&path).await
    }

    async fn recorded_ports(&self) -> CoreResult<Vec<u16>> {
        Ok(self
            .read_all::<SandboxRecord>("sandboxes")
            .await?
            .into_iter()
            .filter_map(|r| r.port)
            .collect())
    }
}
