//! # kiln_templates
//!
//! Project classification and built-in templates for kiln.
//!
//! Requirements text is mapped to a [`ProjectType`] by keyword match, and
//! each type has a compiled-in [`ProjectTemplate`] that renders into the
//! files, install step, and server launch for one application.
//!
//! ## Example
//!
//! ```rust
//! use kiln_templates::{classify_project, ProjectTemplate, ProjectType, TemplateContext};
//!
//! let project_type = classify_project("a todo list app");
//! assert_eq!(project_type, ProjectType::Static);
//!
//! let project = ProjectTemplate::for_type(project_type)
//!     .render(&TemplateContext::new("a todo list app", 8000))
//!     .unwrap();
//! assert_eq!(project.files.len(), 3);
//! ```

pub mod catalog;
pub mod error;
pub mod project;
pub mod renderer;

pub use catalog::{
    InstallStep, ProjectTemplate, RenderedFile, RenderedProject, ServerLaunch, TemplateContext,
    TemplateFile, DEFAULT_EXCERPT_CHARS, SERVER_LOG_FILE, SERVER_PID_FILE,
};
pub use error::{TemplateError, TemplateResult};
pub use project::{classify_project, ProjectType, ServerKind};
pub use renderer::{escape_markup, excerpt, TemplateRenderer};
