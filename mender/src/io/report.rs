//! Per-run product artifacts under `.mender/`.
//!
//! These files are the run's durable output, written regardless of tracing
//! configuration: a chronological event log, per-pass reply and gate
//! captures, the final summary, and the next-steps note an operator reads
//! when a run ends without success.

use std::cell::RefCell;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::outcome::{FatalKind, GateReport, RetryKind};

/// Resolved layout of the state directory for one checkout.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_path: PathBuf,
    pub feedback_path: PathBuf,
    pub next_steps_path: PathBuf,
    pub config_path: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        let state_dir = root.join(".mender");
        Self {
            reports_dir: state_dir.join("reports"),
            lock_path: state_dir.join("run.lock"),
            feedback_path: state_dir.join("feedback.txt"),
            next_steps_path: state_dir.join("next_steps.txt"),
            config_path: state_dir.join("config.toml"),
            state_dir,
        }
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{run_id}.log"))
    }

    pub fn summary_path(&self, run_id: &str) -> PathBuf {
        self.reports_dir.join(format!("{run_id}.summary.md"))
    }

    pub fn pass_dir(&self, run_id: &str, pass: u32) -> PathBuf {
        self.reports_dir.join(run_id).join(format!("pass-{pass}"))
    }
}

/// Append-only chronological event stream for one run, mirrored to tracing.
#[derive(Debug)]
pub struct RunLog {
    file: RefCell<File>,
}

impl RunLog {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create reports dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open run log {}", path.display()))?;
        Ok(Self {
            file: RefCell::new(file),
        })
    }

    /// Append one timestamped line. Logging must never abort the run, so
    /// write failures degrade to a tracing warning.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(target: "mender::run", "{message}");
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{stamp}] {message}\n");
        if let Err(err) = self.file.borrow_mut().write_all(line.as_bytes()) {
            warn!(err = %err, "could not append to run log");
        }
    }
}

/// Bookkeeping record for one pass, written as `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct PassMeta {
    pub run_id: String,
    pub pass: u32,
    /// Terminal label: "success", "no-edits", "retry", or "fatal".
    pub outcome: String,
    pub retry: Option<RetryKind>,
    pub fatal: Option<FatalKind>,
}

/// Write the reply and gate captures for one pass.
pub fn write_pass_artifacts(
    pass_dir: &Path,
    reply_text: &str,
    gate: Option<&GateReport>,
) -> Result<()> {
    fs::create_dir_all(pass_dir)
        .with_context(|| format!("create pass dir {}", pass_dir.display()))?;
    fs::write(pass_dir.join("reply.md"), reply_text)
        .with_context(|| format!("write reply in {}", pass_dir.display()))?;
    if let Some(report) = gate {
        fs::write(pass_dir.join("gate.log"), render_gate_log(report))
            .with_context(|| format!("write gate log in {}", pass_dir.display()))?;
        write_json(&pass_dir.join("gate.json"), report)?;
    }
    Ok(())
}

/// Write the pass bookkeeping record.
pub fn write_pass_meta(pass_dir: &Path, meta: &PassMeta) -> Result<()> {
    fs::create_dir_all(pass_dir)
        .with_context(|| format!("create pass dir {}", pass_dir.display()))?;
    write_json(&pass_dir.join("meta.json"), meta)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// Human-readable capture of a gate run for `gate.log`.
fn render_gate_log(report: &GateReport) -> String {
    let mut buf = String::new();
    for step in &report.steps {
        buf.push_str(&format!(
            "--- {} ({}) ---\n{}\n",
            step.command,
            if step.success { "ok" } else { "failed" },
            step.output
        ));
    }
    if buf.is_empty() {
        buf.push_str("(no gate steps configured)\n");
    }
    buf
}

/// Persist the final model-reported summary for the run.
pub fn write_summary(path: &Path, run_id: &str, summary: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create reports dir {}", parent.display()))?;
    }
    let body = format!(
        "# Run {run_id}\n\n{}\n",
        if summary.trim().is_empty() {
            "(no summary text)"
        } else {
            summary.trim()
        }
    );
    fs::write(path, body).with_context(|| format!("write summary {}", path.display()))
}

/// Write the operator-facing next-steps note.
pub fn write_next_steps(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }
    fs::write(path, text).with_context(|| format!("write next steps {}", path.display()))
}

/// Drop the oldest report entries beyond `keep`, newest first by mtime.
pub fn prune_reports(reports_dir: &Path, keep: usize) -> Result<()> {
    if !reports_dir.exists() {
        return Ok(());
    }
    let mut entries: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(reports_dir)
        .with_context(|| format!("read reports dir {}", reports_dir.display()))?
    {
        let entry = entry.context("read reports entry")?;
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        entries.push((modified, entry.path()));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in entries.into_iter().skip(keep) {
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = result {
            warn!(path = %path.display(), err = %err, "could not prune report");
        }
    }
    Ok(())
}
