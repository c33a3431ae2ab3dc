//! Placeholder rendering for template files.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{TemplateError, TemplateResult};

/// Template renderer replacing `{{variable}}` placeholders.
pub struct TemplateRenderer {
    variable_pattern: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a new template renderer.
    pub fn new() -> Self {
        Self {
            // Match {{variable_name}} pattern
            variable_pattern: Regex::new(r"\{\{([a-zA-Z_][a-zA-Z0-9_]*)\}\}").expect("valid regex"),
        }
    }

    /// Render content by replacing variables in a single pass.
    ///
    /// Substituted values are never re-scanned, so user text containing
    /// placeholder syntax is inserted literally.
    pub fn render(
        &self,
        file: &str,
        content: &str,
        variables: &HashMap<String, String>,
    ) -> TemplateResult<String> {
        if let Some(missing) = self
            .variables_in(content)
            .into_iter()
            .find(|name| !variables.contains_key(name))
        {
            return Err(TemplateError::RenderingFailed {
                file: file.to_string(),
                message: TemplateError::MissingVariable(missing).to_string(),
            });
        }

        Ok(self
            .variable_pattern
            .replace_all(content, |caps: &regex::Captures| {
                variables.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }

    /// Names of all placeholders in `content`, in order of appearance.
    pub fn variables_in(&self, content: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.variable_pattern.captures_iter(content) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// First `max_chars` characters of `text`, with an ellipsis when shortened.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", trimmed[..idx].trim_end()),
        None => trimmed.to_string(),
    }
}

/// Escape text for HTML bodies and JSX children.
///
/// Braces are escaped too so the text cannot open a JSX expression.
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '{' => out.push_str("&#123;"),
            '}' => out.push_str("&#125;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_content() {
        let renderer = TemplateRenderer::new();
        let rendered = renderer
            .render(
                "server.js",
                "const PORT = {{port}}; // {{title}}",
                &vars(&[("port", "8000"), ("title", "Todo")]),
            )
            .unwrap();
        assert_eq!(rendered, "const PORT = 8000; // Todo");
    }

    #[test]
    fn test_render_is_single_pass() {
        let renderer = TemplateRenderer::new();
        let rendered = renderer
            .render(
                "index.html",
                "<p>{{requirements_excerpt}}</p>",
                &vars(&[("requirements_excerpt", "{{port}}"), ("port", "8000")]),
            )
            .unwrap();
        assert_eq!(rendered, "<p>{{port}}</p>");
    }

    #[test]
    fn test_missing_variable_is_error() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render("App.js", "{{title}}", &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("App.js"));
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_js_template_literals_untouched() {
        let renderer = TemplateRenderer::new();
        let content = "console.log(`http://${HOST}:${PORT}/`);";
        assert!(renderer.variables_in(content).is_empty());
        assert_eq!(renderer.render("x.js", content, &HashMap::new()).unwrap(), content);
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 100), "short");
        assert_eq!(excerpt("abcdefgh", 4), "abcd...");
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
    }

    #[test]
    fn test_escape_markup() {
        assert_eq!(
            escape_markup("<b>Tom & {Jerry}</b>"),
            "&lt;b&gt;Tom &amp; &#123;Jerry&#125;&lt;/b&gt;"
        );
    }
}
