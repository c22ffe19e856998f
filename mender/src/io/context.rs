//! Context assembler: turns scanned files into one bounded text blob.
//!
//! Two modes: full-repository (every scanned file) and selected (the
//! discovery pick). Every file contributes at least its header line and, when
//! oversized, a head+tail slice around an explicit truncation marker, so a
//! file is never dropped silently.

use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, instrument};

/// Which files feed the context blob.
#[derive(Debug, Clone)]
pub enum ContextMode {
    /// Every non-ignored scanned file.
    Full,
    /// Only the files a discovery request selected.
    Selected(Vec<String>),
}

/// Concatenate file contents with a path header per file.
#[instrument(skip_all, fields(files = scanned.len()))]
pub fn assemble_context(
    root: &Path,
    scanned: &[String],
    mode: &ContextMode,
    max_read_bytes: usize,
) -> Result<String> {
    let chosen: Vec<&String> = match mode {
        ContextMode::Full => scanned.iter().collect(),
        ContextMode::Selected(selected) => selected
            .iter()
            .filter(|path| scanned.contains(*path))
            .collect(),
    };

    let mut blob = String::new();
    for rel in &chosen {
        blob.push_str(&format!("==== {rel} ====\n"));
        blob.push_str(&read_capped(&root.join(rel), max_read_bytes));
        if !blob.ends_with('\n') {
            blob.push('\n');
        }
    }
    debug!(files = chosen.len(), bytes = blob.len(), "assembled context");
    Ok(blob)
}

/// Read a file capped at `max_bytes`. Oversized files keep both extremities
/// around a marker naming how much was cut; unreadable files keep a
/// placeholder so the loss stays visible to the model.
fn read_capped(path: &Path, max_bytes: usize) -> String {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(_) => return "(could not read file content)\n".to_string(),
    };
    if raw.len() <= max_bytes {
        return String::from_utf8_lossy(&raw).into_owned();
    }
    let half = max_bytes / 2;
    let head = String::from_utf8_lossy(&raw[..half]);
    let tail = String::from_utf8_lossy(&raw[raw.len() - half..]);
    format!(
        "{head}\n[... truncated {} of {} bytes ...]\n{tail}",
        raw.len() - max_bytes,
        raw.len()
    )
}
