//! Built-in project templates.
//!
//! Template bodies live under `templates/` in this crate and are compiled in;
//! rendering resolves them against a [`TemplateContext`] into absolute paths
//! inside the sandbox.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TemplateResult;
use crate::project::{ProjectType, ServerKind};
use crate::renderer::{escape_markup, excerpt, TemplateRenderer};

/// Where the server's process id is recorded inside the sandbox.
pub const SERVER_PID_FILE: &str = "/tmp/server.pid";
/// Where the server's output is redirected inside the sandbox.
pub const SERVER_LOG_FILE: &str = "/tmp/server.log";

const STATIC_SERVER_SCRIPT: &str = "/tmp/server.js";
const DEV_SERVER_SCRIPT: &str = "/tmp/start_server.sh";

/// Default number of requirement characters shown in generated pages.
pub const DEFAULT_EXCERPT_CHARS: usize = 100;

/// A file shipped with a template, relative to the project root.
#[derive(Debug, Clone, Copy)]
pub struct TemplateFile {
    pub path: &'static str,
    pub purpose: &'static str,
    source: &'static str,
}

/// Dependency installation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstallStep {
    pub package_manager: &'static str,
    pub command: &'static str,
}

/// A built-in project template.
#[derive(Debug)]
pub struct ProjectTemplate {
    pub project_type: ProjectType,
    /// Directories created before any file is written
    pub directories: &'static [&'static str],
    pub files: &'static [TemplateFile],
    pub install: Option<InstallStep>,
}

const STATIC_FILES: &[TemplateFile] = &[
    TemplateFile {
        path: "index.html",
        purpose: "Main HTML page",
        source: include_str!("../templates/static/index.html"),
    },
    TemplateFile {
        path: "styles.css",
        purpose: "Stylesheet",
        source: include_str!("../templates/static/styles.css"),
    },
    TemplateFile {
        path: "app.js",
        purpose: "Main JavaScript",
        source: include_str!("../templates/static/app.js"),
    },
];

const REACT_FILES: &[TemplateFile] = &[
    TemplateFile {
        path: "package.json",
        purpose: "Package configuration",
        source: include_str!("../templates/react/package.json"),
    },
    TemplateFile {
        path: "public/index.html",
        purpose: "HTML shell",
        source: include_str!("../templates/react/index.html"),
    },
    TemplateFile {
        path: "src/index.js",
        purpose: "React entry point",
        source: include_str!("../templates/react/index.js"),
    },
    TemplateFile {
        path: "src/App.js",
        purpose: "Root component",
        source: include_str!("../templates/react/App.js"),
    },
    TemplateFile {
        path: "src/App.css",
        purpose: "Component styles",
        source: include_str!("../templates/react/App.css"),
    },
    TemplateFile {
        path: "src/index.css",
        purpose: "Global styles",
        source: include_str!("../templates/react/index.css"),
    },
];

static STATIC_TEMPLATE: ProjectTemplate = ProjectTemplate {
    project_type: ProjectType::Static,
    directories: &[],
    files: STATIC_FILES,
    install: None,
};

// Interactive pages share the static base for now.
static DYNAMIC_TEMPLATE: ProjectTemplate = ProjectTemplate {
    project_type: ProjectType::Dynamic,
    directories: &[],
    files: STATIC_FILES,
    install: None,
};

static REACT_TEMPLATE: ProjectTemplate = ProjectTemplate {
    project_type: ProjectType::React,
    directories: &["public", "src"],
    files: REACT_FILES,
    install: Some(InstallStep {
        package_manager: "npm",
        command: "npm install --legacy-peer-deps",
    }),
};

/// Values substituted into template files.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub title: String,
    pub requirements: String,
    /// Internal port the server listens on
    pub port: u16,
    /// Project root inside the sandbox
    pub workdir: String,
    pub excerpt_chars: usize,
}

impl TemplateContext {
    pub fn new(requirements: impl Into<String>, port: u16) -> Self {
        Self {
            title: "Your Application".to_string(),
            requirements: requirements.into(),
            port,
            workdir: "/app".to_string(),
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn excerpt_chars(mut self, chars: usize) -> Self {
        self.excerpt_chars = chars;
        self
    }

    fn variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("title".to_string(), escape_markup(&self.title));
        vars.insert(
            "requirements_excerpt".to_string(),
            escape_markup(&excerpt(&self.requirements, self.excerpt_chars)),
        );
        vars.insert("port".to_string(), self.port.to_string());
        vars.insert("workdir".to_string(), self.workdir.trim_end_matches('/').to_string());
        vars
    }

    fn absolute(&self, relative: &str) -> String {
        format!("{}/{}", self.workdir.trim_end_matches('/'), relative)
    }
}

/// A file ready to be written into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFile {
    /// Absolute path inside the sandbox
    pub path: String,
    pub purpose: String,
    pub content: String,
}

/// How to start and inspect the project's HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLaunch {
    pub kind: ServerKind,
    /// Helper scripts written before the start command runs
    pub support_files: Vec<RenderedFile>,
    /// Shell command that backgrounds the server and records its pid
    pub command: String,
    pub port: u16,
}

impl ServerLaunch {
    fn for_kind(kind: ServerKind, ctx: &TemplateContext) -> TemplateResult<Self> {
        let renderer = TemplateRenderer::new();
        let vars = ctx.variables();
        let workdir = ctx.workdir.trim_end_matches('/');

        let (script, source, purpose, command) = match kind {
            ServerKind::StaticFiles => (
                STATIC_SERVER_SCRIPT,
                include_str!("../templates/server/static_server.js"),
                "Static file server",
                format!(
                    "cd {} && nohup node {} > {} 2>&1 & echo $! > {}",
                    workdir, STATIC_SERVER_SCRIPT, SERVER_LOG_FILE, SERVER_PID_FILE
                ),
            ),
            ServerKind::DevServer => (
                DEV_SERVER_SCRIPT,
                include_str!("../templates/server/start_dev_server.sh"),
                "Development server launcher",
                format!("chmod +x {0} && {0}", DEV_SERVER_SCRIPT),
            ),
        };

        Ok(Self {
            kind,
            support_files: vec![RenderedFile {
                path: script.to_string(),
                purpose: purpose.to_string(),
                content: renderer.render(script, source, &vars)?,
            }],
            command,
            port: ctx.port,
        })
    }

    /// Command that stops the server recorded in the pid file, if any.
    pub fn stop_command(&self) -> String {
        format!(
            "[ -f {0} ] && kill $(cat {0}) 2>/dev/null; rm -f {0}",
            SERVER_PID_FILE
        )
    }

    /// Command that reports whether the recorded server process is alive.
    pub fn pid_check_command(&self) -> String {
        format!(
            "kill -0 $(cat {0} 2>/dev/null) 2>/dev/null && echo \"pid $(cat {0})\" || echo 'Server process not found'",
            SERVER_PID_FILE
        )
    }

    /// Command that exits 0 when the server port accepts connections.
    pub fn port_probe_command(&self) -> String {
        format!("nc -z 127.0.0.1 {}", self.port)
    }

    /// Command printing the last `lines` lines of the server log.
    pub fn log_tail_command(&self, lines: usize) -> String {
        format!(
            "tail -n {} {} 2>&1 || echo 'Log file not found yet'",
            lines, SERVER_LOG_FILE
        )
    }
}

/// A template rendered for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedProject {
    pub project_type: ProjectType,
    /// Absolute directories to create
    pub directories: Vec<String>,
    pub files: Vec<RenderedFile>,
    pub install: Option<InstallStep>,
    pub server: ServerLaunch,
}

impl ProjectTemplate {
    /// Template used for a project type.
    pub fn for_type(project_type: ProjectType) -> &'static ProjectTemplate {
        match project_type {
            ProjectType::Static => &STATIC_TEMPLATE,
            ProjectType::Dynamic => &DYNAMIC_TEMPLATE,
            ProjectType::React => &REACT_TEMPLATE,
        }
    }

    /// Render every file against `ctx`.
    pub fn render(&self, ctx: &TemplateContext) -> TemplateResult<RenderedProject> {
        let renderer = TemplateRenderer::new();
        let vars = ctx.variables();

        let files = self
            .files
            .iter()
            .map(|file| {
                let path = ctx.absolute(file.path);
                let content = renderer.render(&path, file.source, &vars)?;
                Ok(RenderedFile {
                    path,
                    purpose: file.purpose.to_string(),
                    content,
                })
            })
            .collect::<TemplateResult<Vec<_>>>()?;

        debug!(
            "Rendered {} template ({} files)",
            self.project_type,
            files.len()
        );

        Ok(RenderedProject {
            project_type: self.project_type,
            directories: self.directories.iter().map(|d| ctx.absolute(d)).collect(),
            files,
            install: self.install,
            server: ServerLaunch::for_kind(self.project_type.server_kind(), ctx)?,
        })
    }
}
