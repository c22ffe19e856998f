//! Operator feedback channel: a human-writable file consumed once.
//!
//! The operator drops redirection notes into `.mender/feedback.txt` between
//! runs (or between passes). Non-empty content is consumed at the start of a
//! pass and the file is rotated aside so the same note never steers two
//! passes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

/// Read and rotate the operator feedback file. Returns `None` when the file
/// is missing or effectively empty.
pub fn consume_feedback(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("read feedback {}", path.display()))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let rotated = path.with_file_name(format!("feedback.{}.txt", Utc::now().timestamp()));
    match fs::rename(path, &rotated) {
        Ok(()) => info!(rotated = %rotated.display(), "consumed operator feedback"),
        // Keep the content even if rotation failed; the next pass may see the
        // note twice, which beats losing it.
        Err(err) => warn!(err = %err, "could not rotate feedback file"),
    }
    Ok(Some(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let got = consume_feedback(&temp.path().join("feedback.txt")).expect("consume");
        assert!(got.is_none());
    }

    #[test]
    fn blank_file_yields_none_and_stays() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feedback.txt");
        fs::write(&path, "  \n\n").expect("write");
        let got = consume_feedback(&path).expect("consume");
        assert!(got.is_none());
        assert!(path.exists());
    }

    #[test]
    fn content_is_returned_once_and_rotated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("feedback.txt");
        fs::write(&path, "focus on the parser\n").expect("write");

        let first = consume_feedback(&path).expect("consume");
        assert_eq!(first.as_deref(), Some("focus on the parser"));
        assert!(!path.exists());

        let second = consume_feedback(&path).expect("consume again");
        assert!(second.is_none());

        let rotated: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("feedback.")
            })
            .collect();
        assert_eq!(rotated.len(), 1);
    }
}
