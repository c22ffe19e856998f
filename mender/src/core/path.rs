//! Sandbox path resolution and write-allowlist matching.
//!
//! Resolution is purely lexical: the proposed path is normalized component by
//! component without touching the filesystem, so a path is judged before
//! anything exists at it. The project root is the hard boundary no write may
//! escape.

use std::path::{Component, Path, PathBuf};

/// Why a proposed path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxViolation {
    /// The resolved path would land outside the project root.
    PathEscape { path: String },
    /// The path is inside the root but not covered by the allowlist.
    WriteNotAllowed { path: String },
}

impl std::fmt::Display for SandboxViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxViolation::PathEscape { path } => {
                write!(f, "path_escape: '{path}' resolves outside the project root")
            }
            SandboxViolation::WriteNotAllowed { path } => {
                write!(f, "write_not_allowed: '{path}' is not in the write allowlist")
            }
        }
    }
}

impl std::error::Error for SandboxViolation {}

/// Set of path prefixes the applier may write under.
///
/// The literal empty-string entry means allow-all. That value must be spelled
/// out in configuration; an empty list allows nothing (and config validation
/// rejects it so a deployment always makes the choice explicitly).
#[derive(Debug, Clone)]
pub struct Allowlist {
    prefixes: Vec<String>,
}

impl Allowlist {
    pub fn new(prefixes: Vec<String>) -> Self {
        let prefixes = prefixes
            .into_iter()
            .map(|p| p.replace('\\', "/"))
            .collect();
        Self { prefixes }
    }

    pub fn allows_all(&self) -> bool {
        self.prefixes.iter().any(String::is_empty)
    }

    /// Whether a normalized relative path (forward slashes) is writable.
    pub fn permits(&self, rel: &str) -> bool {
        let rel = rel.replace('\\', "/");
        self.prefixes.iter().any(|prefix| {
            if prefix.is_empty() {
                return true;
            }
            let trimmed = prefix.trim_end_matches('/');
            rel == trimmed || rel.starts_with(&format!("{trimmed}/"))
        })
    }
}

/// Lexically resolve `rel` against `root`, refusing anything that escapes.
///
/// Returns the normalized relative path (forward slashes) and the absolute
/// target path. Absolute inputs, drive prefixes, and `..` traversal past the
/// root all reject with [`SandboxViolation::PathEscape`].
pub fn resolve_sandboxed(
    root: &Path,
    rel: &str,
) -> Result<(String, PathBuf), SandboxViolation> {
    let candidate = Path::new(rel);
    let mut parts: Vec<String> = Vec::new();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s.to_string()),
                None => {
                    return Err(SandboxViolation::PathEscape {
                        path: rel.to_string(),
                    })
                }
            },
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxViolation::PathEscape {
                        path: rel.to_string(),
                    });
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxViolation::PathEscape {
                    path: rel.to_string(),
                })
            }
        }
    }

    if parts.is_empty() {
        // The root itself is a directory, never a writable file target.
        return Err(SandboxViolation::PathEscape {
            path: rel.to_string(),
        });
    }

    let normalized = parts.join("/");
    let absolute = parts.iter().fold(root.to_path_buf(), |p, part| p.join(part));
    Ok((normalized, absolute))
}
