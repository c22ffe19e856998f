//! Workspace scanner: ordered tracked-file listing with ignore filtering.
//!
//! The primary listing comes from git; when that is unavailable (not a
//! repository, git missing) the scanner degrades to a plain directory walk so
//! a run can still assemble context. Filtering matches whole path segments,
//! never substrings, so `building/` survives an ignored `build` segment.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::io::git::Git;

/// Enumerate candidate context files as relative paths.
#[instrument(skip_all)]
pub fn scan_workspace(git: &Git, ignore_segments: &[String]) -> Result<Vec<String>> {
    let listed = match git.ls_files() {
        Ok(files) => files,
        Err(err) => {
            warn!(err = %err, "git listing unavailable, falling back to directory walk");
            walk_files(git.workdir())
        }
    };

    let files: Vec<String> = listed
        .into_iter()
        .filter(|path| !has_ignored_segment(path, ignore_segments))
        .collect();
    debug!(count = files.len(), "scanned workspace");
    Ok(files)
}

/// Render the scanned list as the bare file tree for discovery requests.
pub fn render_file_tree(files: &[String]) -> String {
    files.join("\n")
}

fn walk_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name().into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let display = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/");
            if !display.is_empty() {
                files.push(display);
            }
        }
    }
    files
}

fn has_ignored_segment(path: &str, ignore_segments: &[String]) -> bool {
    path.split('/')
        .any(|segment| ignore_segments.iter().any(|ig| ig == segment))
}
