//! Project type classification.
//!
//! The project type is a pure function of the requirements text: a framework
//! name selects that framework's template, interactivity terms select the
//! dynamic template, and everything else is served as static files.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of project generated for a set of requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    /// Plain markup, styles and script
    Static,
    /// Interactive page; currently shares the static base
    Dynamic,
    /// React single-page app with a dev server
    React,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::React => "react",
        }
    }

    /// Human-readable label used in progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Static => "static HTML",
            Self::Dynamic => "interactive HTML/JavaScript",
            Self::React => "React",
        }
    }

    /// How the generated project is served.
    pub fn server_kind(&self) -> ServerKind {
        match self {
            Self::Static | Self::Dynamic => ServerKind::StaticFiles,
            Self::React => ServerKind::DevServer,
        }
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mechanism that serves a generated project over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Small Node.js static file server
    StaticFiles,
    /// Framework dev server started through npm
    DevServer,
}

impl ServerKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StaticFiles => "static file",
            Self::DevServer => "development",
        }
    }
}

fn framework_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\breact(js)?\b").expect("valid regex"))
}

fn interactivity_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(interactive|interactivity|dynamic|forms?|apis?)\b").expect("valid regex")
    })
}

/// Classify requirements text into a project type.
pub fn classify_project(requirements: &str) -> ProjectType {
    if framework_pattern().is_match(requirements) {
        ProjectType::React
    } else if interactivity_pattern().is_match(requirements) {
        ProjectType::Dynamic
    } else {
        ProjectType::Static
    }
}
