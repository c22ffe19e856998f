//! Edit applier: sandbox-checked full-replace writes.
//!
//! Proposals apply in reply order. Each one is validated (sandbox, allowlist)
//! before anything is touched, so a rejected proposal leaves the filesystem
//! exactly as it was. The first failure of any kind aborts the remaining
//! proposals in the pass; what was already applied is reported back so the
//! revert controller has concrete targets.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, instrument, warn};

use crate::core::path::{resolve_sandboxed, Allowlist, SandboxViolation};
use crate::core::protocol::EditDirective;

/// Why application stopped early.
#[derive(Debug)]
pub enum ApplyFailure {
    /// Path escaped the root or missed the allowlist. Escalated, not retried.
    Sandbox(SandboxViolation),
    /// A filesystem write failed. `fatal` marks permission-class errors that
    /// make further passes pointless.
    Write {
        path: String,
        detail: String,
        fatal: bool,
    },
}

impl std::fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyFailure::Sandbox(v) => write!(f, "{v}"),
            ApplyFailure::Write { path, detail, .. } => {
                write!(f, "write failed for '{path}': {detail}")
            }
        }
    }
}

/// Result of applying one pass's proposals.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Normalized relative paths written, in order.
    pub applied: Vec<String>,
    /// Set when application stopped before the last proposal.
    pub failure: Option<ApplyFailure>,
}

impl ApplyOutcome {
    /// Whether the pass produced at least one edit.
    pub fn edited(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Apply proposals in order: validate, ensure parents, full-replace write.
#[instrument(skip_all, fields(proposals = edits.len()))]
pub fn apply_edits(root: &Path, allowlist: &Allowlist, edits: &[EditDirective]) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    for edit in edits {
        let (rel, absolute) = match resolve_sandboxed(root, &edit.path) {
            Ok(resolved) => resolved,
            Err(violation) => {
                warn!(path = %edit.path, %violation, "rejected proposal");
                outcome.failure = Some(ApplyFailure::Sandbox(violation));
                return outcome;
            }
        };
        if !allowlist.permits(&rel) {
            let violation = SandboxViolation::WriteNotAllowed { path: rel };
            warn!(%violation, "rejected proposal");
            outcome.failure = Some(ApplyFailure::Sandbox(violation));
            return outcome;
        }

        if let Err(err) = write_full_replace(&absolute, &edit.content) {
            let fatal = err.kind() == ErrorKind::PermissionDenied;
            warn!(path = %rel, err = %err, fatal, "write failed, aborting pass");
            outcome.failure = Some(ApplyFailure::Write {
                path: rel,
                detail: err.to_string(),
                fatal,
            });
            return outcome;
        }

        debug!(path = %rel, bytes = edit.content.len(), "applied edit");
        outcome.applied.push(rel);
    }

    outcome
}

/// Remove any pre-existing file first so the write is a full replace, never a
/// partial overlay of stale bytes.
fn write_full_replace(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::write(path, content)
}
