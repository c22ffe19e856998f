//! Test-only helpers: scripted collaborators and a disposable git repo.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

use crate::core::outcome::{GateReport, GateStepReport};
use crate::io::backend::{BackendError, ModelBackend, ModelReply, ModelRequest};
use crate::io::gate::{GateRequest, GateRunner};
use crate::io::git::Git;

/// Backend returning a scripted sequence of replies or errors.
pub struct ScriptedBackend {
    script: RefCell<VecDeque<Result<ModelReply, BackendError>>>,
    token_count: Option<usize>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Result<ModelReply, BackendError>>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            token_count: None,
        }
    }

    /// Convenience constructor from plain reply texts.
    pub fn with_replies(texts: &[&str]) -> Self {
        Self::new(
            texts
                .iter()
                .map(|t| {
                    Ok(ModelReply {
                        text: (*t).to_string(),
                    })
                })
                .collect(),
        )
    }

    /// Make `count_tokens` report a fixed exact count.
    pub fn reporting_tokens(mut self, count: usize) -> Self {
        self.token_count = Some(count);
        self
    }
}

impl ModelBackend for ScriptedBackend {
    fn generate(&self, _request: &ModelRequest) -> Result<ModelReply, BackendError> {
        self.script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Service("script exhausted".to_string())))
    }

    fn count_tokens(&self, _request: &ModelRequest) -> Option<usize> {
        self.token_count
    }
}

/// Gate runner returning scripted reports; an exhausted script is green.
pub struct ScriptedGate {
    script: RefCell<VecDeque<GateReport>>,
}

impl ScriptedGate {
    pub fn new(reports: Vec<GateReport>) -> Self {
        Self {
            script: RefCell::new(reports.into()),
        }
    }

    pub fn always_green() -> Self {
        Self::new(Vec::new())
    }

    /// A one-step failing report with the given captured output.
    pub fn failing_report(command: &str, output: &str) -> GateReport {
        GateReport {
            steps: vec![GateStepReport {
                command: command.to_string(),
                success: false,
                output: output.to_string(),
            }],
        }
    }
}

impl GateRunner for ScriptedGate {
    fn run(&self, _request: &GateRequest) -> Result<GateReport> {
        Ok(self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or_default())
    }
}

/// Disposable git repository with one seed commit.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let root = temp.path();
        git_ok(root, &["init", "--initial-branch=main"])?;
        git_ok(root, &["config", "user.email", "test@example.com"])?;
        git_ok(root, &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write seed file")?;
        fs::write(root.join(".gitignore"), ".mender/\n").context("write gitignore")?;
        git_ok(root, &["add", "-A"])?;
        git_ok(root, &["commit", "-m", "chore: init"])?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.root())
    }

    pub fn write_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content).context("write file")?;
        Ok(())
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        fs::read_to_string(self.root().join(rel)).context("read file")
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        git_ok(self.root(), &["add", "-A"])?;
        git_ok(self.root(), &["commit", "-m", message])?;
        Ok(())
    }

    pub fn head_message(&self) -> Result<String> {
        let out = Command::new("git")
            .args(["log", "-1", "--pretty=%B"])
            .current_dir(self.root())
            .output()
            .context("git log")?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn git_ok(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&status.stderr).trim()
        ));
    }
    Ok(())
}
