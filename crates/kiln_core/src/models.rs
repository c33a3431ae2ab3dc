//! Persisted entities: applications and their sandbox records.

use std::fmt;

use chrono::{DateTime, Utc};
use kiln_runner::ResourceLimits;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Lifecycle status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    #[default]
    Draft,
    RequirementsConfirmed,
    Generating,
    Deploying,
    Running,
    Stopped,
    Error,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::RequirementsConfirmed => "requirements_confirmed",
            Self::Generating => "generating",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::RequirementsConfirmed => 1,
            Self::Generating => 2,
            Self::Deploying => 3,
            Self::Running => 4,
            Self::Stopped => 5,
            Self::Error => 6,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Statuses only move forward. Any status may fall into `error`, and
    /// `generating` is re-entered explicitly from `deploying`, `running`,
    /// `stopped` or `error` to regenerate. A run interrupted mid-deploy
    /// leaves `deploying` behind.
    pub fn can_transition_to(&self, next: ApplicationStatus) -> bool {
        use ApplicationStatus::*;

        match (*self, next) {
            (a, b) if a == b => true,
            (_, Error) => true,
            (Deploying | Running | Stopped | Error, Generating) => true,
            (Running, Stopped) => true,
            (_, Stopped) | (Error, _) | (Stopped, _) => false,
            (a, b) => b.rank() > a.rank(),
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An application being specified, generated and previewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub requirements: Option<String>,
    #[serde(default)]
    pub requirements_confirmed: bool,
    #[serde(default)]
    pub status: ApplicationStatus,
    #[serde(default)]
    pub sandbox_handle: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
}

impl Application {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            name: name.into(),
            requirements: None,
            requirements_confirmed: false,
            status: ApplicationStatus::Draft,
            sandbox_handle: None,
            preview_url: None,
            port: None,
            created_at: now,
            updated_at: now,
            last_deployed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Requirements text, if any non-blank text is recorded.
    pub fn requirements_text(&self) -> Option<&str> {
        self.requirements
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// Partial update of an application. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicationUpdate {
    pub name: Option<String>,
    pub requirements: Option<String>,
    pub requirements_confirmed: Option<bool>,
    pub status: Option<ApplicationStatus>,
    pub sandbox_handle: Option<Option<String>>,
    pub preview_url: Option<Option<String>>,
    pub port: Option<Option<u16>>,
}

impl ApplicationUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requirements(mut self, requirements: impl Into<String>) -> Self {
        self.requirements = Some(requirements.into());
        self
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.requirements_confirmed = Some(confirmed);
        self
    }

    pub fn status(mut self, status: ApplicationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn sandbox_handle(mut self, handle: Option<String>) -> Self {
        self.sandbox_handle = Some(handle);
        self
    }

    pub fn preview_url(mut self, url: Option<String>) -> Self {
        self.preview_url = Some(url);
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    /// Apply the update, validating the status transition and the
    /// confirmed-implies-requirements invariant.
    pub fn apply(self, app: &mut Application) -> CoreResult<()> {
        if let Some(next) = self.status {
            if !app.status.can_transition_to(next) {
                return Err(CoreError::InvalidTransition {
                    id: app.id.clone(),
                    from: app.status.to_string(),
                    to: next.to_string(),
                });
            }
        }

        let requirements = self.requirements.or_else(|| app.requirements.clone());
        let confirmed = self
            .requirements_confirmed
            .unwrap_or(app.requirements_confirmed);
        let has_text = requirements
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false);
        if confirmed && !has_text {
            return Err(CoreError::InvalidState(format!(
                "application {} cannot be confirmed without requirements",
                app.id
            )));
        }

        let now = Utc::now();
        if let Some(name) = self.name {
            app.name = name;
        }
        app.requirements = requirements;
        app.requirements_confirmed = confirmed;
        if let Some(status) = self.status {
            if status == ApplicationStatus::Running && app.status != ApplicationStatus::Running {
                app.last_deployed_at = Some(now);
            }
            app.status = status;
        }
        if let Some(handle) = self.sandbox_handle {
            app.sandbox_handle = handle;
        }
        if let Some(url) = self.preview_url {
            app.preview_url = url;
        }
        if let Some(port) = self.port {
            app.port = port;
        }
        app.updated_at = now;
        Ok(())
    }
}

/// Status of a sandbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Persisted metadata for the one sandbox owned by an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    /// Runtime handle
    pub handle: String,
    pub application_id: String,
    pub image: String,
    pub status: SandboxStatus,
    /// Host port bound to the internal server port
    #[serde(default)]
    pub port: Option<u16>,
    pub limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    pub fn new(
        handle: impl Into<String>,
        application_id: impl Into<String>,
        image: impl Into<String>,
        limits: ResourceLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            handle: handle.into(),
            application_id: application_id.into(),
            image: image.into(),
            status: SandboxStatus::Creating,
            port: None,
            limits,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a sandbox record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxUpdate {
    pub status: Option<SandboxStatus>,
    pub port: Option<Option<u16>>,
}

impl SandboxUpdate {
    pub fn status(status: SandboxStatus) -> Self {
        Self {
            status: Some(status),
            port: None,
        }
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn apply(self, record: &mut SandboxRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(port) = self.port {
            record.port = port;
        }
        record.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationStatus::*;

    #[test]
    fn test_forward_transitions() {
        assert!(Draft.can_transition_to(RequirementsConfirmed));
        assert!(RequirementsConfirmed.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Deploying));
        assert!(Deploying.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));

        assert!(!Running.can_transition_to(Deploying));
        assert!(!Generating.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Stopped));
    }

    #[test]
    fn test_error_and_restart_transitions() {
        for status in [Draft, RequirementsConfirmed, Generating, Deploying, Running, Stopped] {
            assert!(status.can_transition_to(Error));
        }
        assert!(!Error.can_transition_to(Running));
        assert!(!Error.can_transition_to(Draft));
        assert!(Error.can_transition_to(Generating));
        assert!(Stopped.can_transition_to(Generating));
        assert!(Running.can_transition_to(Generating));
        assert!(Deploying.can_transition_to(Generating));
    }

    #[test]
    fn test_confirm_requires_requirements() {
        let mut app = Application::new("user-1", "todo");
        let err = ApplicationUpdate::new().confirmed(true).apply(&mut app);
        assert!(matches!(err, Err(CoreError::InvalidState(_))));

        ApplicationUpdate::new()
            .requirements("   ")
            .confirmed(true)
            .apply(&mut app)
            .unwrap_err();

        ApplicationUpdate::new()
            .requirements("A todo list")
            .confirmed(true)
            .status(RequirementsConfirmed)
            .apply(&mut app)
            .unwrap();
        assert!(app.requirements_confirmed);
        assert_eq!(app.status, RequirementsConfirmed);
    }

    #[test]
    fn test_running_sets_last_deployed() {
        let mut app = Application::new("user-1", "todo");
        app.status = Deploying;
        assert!(app.last_deployed_at.is_none());

        ApplicationUpdate::new()
            .status(Running)
            .preview_url(Some("http://localhost:6000".into()))
            .port(Some(6000))
            .apply(&mut app)
            .unwrap();
        assert!(app.last_deployed_at.is_some());
        assert_eq!(app.port, Some(6000));
    }

    #[test]
    fn test_invalid_transition_leaves_record_untouched() {
        let mut app = Application::new("user-1", "todo");
        let before = app.clone();
        let err = ApplicationUpdate::new()
            .status(Stopped)
            .requirements("changed")
            .apply(&mut app)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(app, before);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RequirementsConfirmed).unwrap();
        assert_eq!(json, "\"requirements_confirmed\"");
    }
}
