//! Git adapter for the loop and the release workflow.
//!
//! Everything shells out to `git` and reports success/failure plus captured
//! text; no command output is interpreted beyond the porcelain status format.
//! Remote operations (push, tags, pull) return a lenient [`GitResult`] since
//! the release workflow branches on rejection rather than treating it as an
//! error.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Success flag plus captured text for operations the caller branches on.
#[derive(Debug, Clone)]
pub struct GitResult {
    pub ok: bool,
    pub output: String,
}

/// What a revert pass did and what it had to leave alone.
#[derive(Debug, Clone, Default)]
pub struct RevertSummary {
    pub reverted: Vec<String>,
    pub untracked: Vec<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// List tracked files, one relative path per line.
    #[instrument(skip_all)]
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files"])?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    /// Whether a path is tracked (known to the index).
    pub fn is_tracked(&self, rel: &str) -> Result<bool> {
        let out = self.run(&["ls-files", "--error-unmatch", "--", rel])?;
        Ok(out.status.success())
    }

    /// Restore one tracked path to its last committed state.
    #[instrument(skip_all, fields(path = rel))]
    pub fn checkout_from_head(&self, rel: &str) -> Result<GitResult> {
        self.run_lenient(&["checkout", "HEAD", "--", rel])
    }

    /// Restore the given paths to HEAD where tracked. Untracked paths have no
    /// committed state to restore; they are reported back for the caller to
    /// log as anomalies, not errors.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub fn revert_paths(&self, paths: &[String]) -> Result<RevertSummary> {
        let mut summary = RevertSummary::default();
        for rel in paths {
            if self.is_tracked(rel)? {
                let result = self.checkout_from_head(rel)?;
                if !result.ok {
                    return Err(anyhow!("revert '{rel}' failed: {}", result.output));
                }
                summary.reverted.push(rel.clone());
            } else {
                warn!(path = %rel, "untracked path left in place, revert undefined");
                summary.untracked.push(rel.clone());
            }
        }
        Ok(summary)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Stage specific paths.
    pub fn stage_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Rebase the current branch onto the remote head.
    #[instrument(skip_all, fields(branch))]
    pub fn pull_rebase(&self, branch: &str) -> Result<GitResult> {
        self.run_lenient(&["pull", "--rebase", "origin", branch])
    }

    /// Push the current HEAD to the named branch on origin.
    #[instrument(skip_all, fields(branch))]
    pub fn push_head(&self, branch: &str) -> Result<GitResult> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_lenient(&["push", "origin", &refspec])
    }

    /// Create an annotated tag at HEAD.
    #[instrument(skip_all, fields(tag))]
    pub fn tag_annotated(&self, tag: &str, message: &str) -> Result<GitResult> {
        self.run_lenient(&["tag", "-a", tag, "-m", message])
    }

    /// Push one tag to origin.
    #[instrument(skip_all, fields(tag))]
    pub fn push_tag(&self, tag: &str) -> Result<GitResult> {
        self.run_lenient(&["push", "origin", tag])
    }

    /// Delete a local tag (used when a tag push collided).
    #[instrument(skip_all, fields(tag))]
    pub fn delete_local_tag(&self, tag: &str) -> Result<GitResult> {
        self.run_lenient(&["tag", "-d", tag])
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run_lenient(&self, args: &[&str]) -> Result<GitResult> {
        let output = self.run(args)?;
        let ok = output.status.success();
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }
        if !ok {
            warn!(args = %args.join(" "), "git command failed");
        }
        Ok(GitResult {
            ok,
            output: text.trim().to_string(),
        })
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
