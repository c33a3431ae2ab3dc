//! Directory listing and file tree helpers.
//!
//! The engine has no native "list directory" call, so listings are produced
//! by running `ls -lA` inside the sandbox and parsing its long format.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::runner::{DirEntry, EntryKind, SandboxRuntime};

/// Hidden files that are still shown in file trees.
const VISIBLE_DOTFILES: &[&str] = &[".env", ".gitignore"];

/// Default recursion limit for [`file_tree`].
pub const DEFAULT_TREE_DEPTH: usize = 5;

/// Parse the output of `ls -lA` into directory entries.
///
/// The leading `total N` line and malformed lines are skipped.
pub fn parse_ls_output(output: &str) -> Vec<DirEntry> {
    let mut entries = Vec::new();

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }

        let Some((fields, name)) = split_long_format(line) else {
            continue;
        };

        let permissions = fields[0];
        let is_dir = permissions.starts_with('d');
        let name = if permissions.starts_with('l') {
            name.split(" -> ").next().unwrap_or(name)
        } else {
            name
        };

        entries.push(DirEntry {
            name: name.to_string(),
            kind: if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: if is_dir {
                0
            } else {
                fields[4].parse().unwrap_or(0)
            },
            permissions: permissions.to_string(),
        });
    }

    entries
}

// Splits a long-format line into its eight metadata columns and the name,
// keeping whitespace inside the name intact.
fn split_long_format(line: &str) -> Option<([&str; 8], &str)> {
    let mut fields = [""; 8];
    let mut rest = line;

    for field in fields.iter_mut() {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace)?;
        *field = &rest[..end];
        rest = &rest[end..];
    }

    let name = rest.trim_start();
    if name.is_empty() {
        None
    } else {
        Some((fields, name))
    }
}

/// A node in a sandbox file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

/// Build a recursive file tree rooted at `root`.
///
/// Directories come first, then files, each group sorted case-insensitively.
/// A subtree whose listing fails is reported as empty.
pub async fn file_tree(
    runtime: &dyn SandboxRuntime,
    handle: &str,
    root: &str,
    max_depth: usize,
) -> Vec<FileNode> {
    build_tree(runtime, handle, root.to_string(), max_depth, 0).await
}

fn build_tree<'a>(
    runtime: &'a dyn SandboxRuntime,
    handle: &'a str,
    path: String,
    max_depth: usize,
    depth: usize,
) -> BoxFuture<'a, Vec<FileNode>> {
    Box::pin(async move {
        if depth >= max_depth {
            return Vec::new();
        }

        let entries = match runtime.list_directory(handle, &path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list {} in sandbox: {}", path, e);
                return Vec::new();
            }
        };

        let mut nodes = Vec::new();
        for entry in entries {
            if entry.name.starts_with('.') && !VISIBLE_DOTFILES.contains(&entry.name.as_str()) {
                continue;
            }

            let child_path = join_path(&path, &entry.name);
            let children = if entry.kind == EntryKind::Directory {
                build_tree(runtime, handle, child_path.clone(), max_depth, depth + 1).await
            } else {
                Vec::new()
            };

            nodes.push(FileNode {
                name: entry.name,
                kind: entry.kind,
                path: child_path,
                size: entry.size,
                children,
            });
        }

        nodes.sort_by(|a, b| {
            let a_key = (a.kind != EntryKind::Directory, a.name.to_lowercase());
            let b_key = (b.kind != EntryKind::Directory, b.name.to_lowercase());
            a_key.cmp(&b_key)
        });
        nodes
    })
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LS_SAMPLE: &str = "total 16
drwxr-xr-x    2 root     root          4096 Jan  1 00:00 src
-rw-r--r--    1 root     root           344 Jan  1 00:00 index.html
-rw-r--r--    1 root     root            12 Jan  1 00:00 my notes.txt
lrwxrwxrwx    1 root     root             9 Jan  1 00:00 latest -> index.html
-rw-r--r--    1 root     root             5 Jan  1 00:00 .env
";

    #[test]
    fn test_parse_ls_output() {
        let entries = parse_ls_output(LS_SAMPLE);
        assert_eq!(entries.len(), 5);

        assert_eq!(entries[0].name, "src");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].size, 0);

        assert_eq!(entries[1].name, "index.html");
        assert_eq!(entries[1].size, 344);
        assert_eq!(entries[1].permissions, "-rw-r--r--");

        assert_eq!(entries[2].name, "my notes.txt");
        assert_eq!(entries[3].name, "latest");
    }

    #[test]
    fn test_parse_ls_skips_garbage() {
        let entries = parse_ls_output("total 0\nls: /nope: No such file or directory\n\n");
        assert!(entries.is_empty());
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/app", "src"), "/app/src");
        assert_eq!(join_path("/", "app"), "/app");
    }
}
