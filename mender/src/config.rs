//! Loop configuration stored under `.mender/config.toml`.
//!
//! The file is meant to be edited by humans and must stay stable and
//! automatable. Missing fields default to sensible values; a missing file is
//! the defaults. A handful of run toggles can be overridden through `MENDER_*`
//! environment variables, mirroring how unattended deployments flip behavior
//! without touching the checkout. The resulting [`Config`] is immutable and
//! passed into the loop at construction.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// How to treat a structurally valid reply that proposes no edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoEditPolicy {
    /// A reasoned no-edit reply is a valid terminal outcome.
    Accept,
    /// Edits are mandatory; a reply without them gets corrective feedback.
    Retry,
}

/// One gate pipeline step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateStep {
    /// Command and arguments, e.g. `["cargo", "check"]`.
    pub argv: Vec<String>,
    /// Working directory relative to the project root.
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    /// Ordered validation steps; empty means the gate is always green.
    pub steps: Vec<GateStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Chat-completions endpoint URL.
    pub base_url: String,
    /// Model identifier sent with each request.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Cap on generated tokens per reply.
    pub max_output_tokens: u32,
    /// Wall-clock ceiling for one backend call.
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "anthropic/claude-sonnet-4".to_string(),
            api_key_env: "MENDER_API_KEY".to_string(),
            max_output_tokens: 4096,
            request_timeout_secs: 600,
        }
    }
}

/// Loop configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Maximum loop passes per run.
    pub max_passes: u32,

    /// Restore applied edits when the gate fails.
    pub revert_on_failure: bool,

    /// Enable the release workflow after a green gate.
    pub ship: bool,

    /// Ask the model to pre-select relevant files over the bare tree.
    pub discovery: bool,

    /// Treatment of structurally valid replies without edit directives.
    pub no_edit_policy: NoEditPolicy,

    /// Branch the release workflow pushes to.
    pub branch: String,

    /// Path prefixes the applier may write under. The literal `""` entry
    /// means allow-all and must be spelled out; an empty list is invalid.
    pub allowlist: Vec<String>,

    /// Path segments excluded from scanning (exact component match).
    pub ignore_segments: Vec<String>,

    /// Plain-text file holding the current `major.minor.patch` version.
    pub version_file: String,

    /// Dependency lockfile to include in release commits when changed.
    pub lockfile: Option<String>,

    /// Token budget for one request (system + user).
    pub token_budget: usize,

    /// Safety margin subtracted from the budget.
    pub token_margin: usize,

    /// Per-file read cap for context assembly.
    pub max_read_bytes: usize,

    /// Wall-clock ceiling per gate command.
    pub command_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// In-pass retries for rate-limited backend calls.
    pub backend_max_retries: u32,

    /// Release attempts before giving up on shipping.
    pub release_max_attempts: u32,

    /// Newest report files kept when pruning.
    pub reports_keep: usize,

    /// Cap on carried-forward feedback text.
    pub feedback_max_bytes: usize,

    pub gate: GateConfig,

    pub backend: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_passes: 6,
            revert_on_failure: true,
            ship: false,
            discovery: false,
            no_edit_policy: NoEditPolicy::Accept,
            branch: "main".to_string(),
            allowlist: vec![String::new()],
            ignore_segments: default_ignore_segments(),
            version_file: "VERSION".to_string(),
            lockfile: None,
            token_budget: 900_000,
            token_margin: 50_000,
            max_read_bytes: 200_000,
            command_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            backend_max_retries: 2,
            release_max_attempts: 4,
            reports_keep: 100,
            feedback_max_bytes: 40_000,
            gate: GateConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

fn default_ignore_segments() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        ".mender",
        ".venv",
        "node_modules",
        "__pycache__",
        "target",
        "dist",
        "build",
        ".cache",
        ".idea",
        ".vscode",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_passes == 0 {
            return Err(anyhow!("max_passes must be > 0"));
        }
        if self.token_budget <= self.token_margin {
            return Err(anyhow!("token_budget must exceed token_margin"));
        }
        if self.max_read_bytes == 0 {
            return Err(anyhow!("max_read_bytes must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.release_max_attempts == 0 {
            return Err(anyhow!("release_max_attempts must be > 0"));
        }
        if self.allowlist.is_empty() {
            return Err(anyhow!(
                "allowlist must not be empty (use [\"\"] to deliberately allow all paths)"
            ));
        }
        if self.branch.trim().is_empty() {
            return Err(anyhow!("branch must not be empty"));
        }
        if self.version_file.trim().is_empty() {
            return Err(anyhow!("version_file must not be empty"));
        }
        for step in &self.gate.steps {
            if step.argv.is_empty() || step.argv[0].trim().is_empty() {
                return Err(anyhow!("gate step argv must be a non-empty array"));
            }
        }
        if self.backend.base_url.trim().is_empty() || self.backend.model.trim().is_empty() {
            return Err(anyhow!("backend base_url and model must not be empty"));
        }
        Ok(())
    }

    /// Apply `MENDER_*` environment overrides for the run toggles: maximum
    /// passes, revert-on-failure, shipping, and token budget. Verbosity is
    /// `RUST_LOG`, handled by the tracing layer.
    pub fn apply_env_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(raw) = get("MENDER_MAX_PASSES") {
            self.max_passes = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("MENDER_MAX_PASSES must be an integer (got '{raw}')"))?;
        }
        if let Some(raw) = get("MENDER_REVERT_ON_FAIL") {
            self.revert_on_failure = parse_flag("MENDER_REVERT_ON_FAIL", &raw)?;
        }
        if let Some(raw) = get("MENDER_SHIP") {
            self.ship = parse_flag("MENDER_SHIP", &raw)?;
        }
        if let Some(raw) = get("MENDER_TOKEN_BUDGET") {
            self.token_budget = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("MENDER_TOKEN_BUDGET must be an integer (got '{raw}')"))?;
        }
        Ok(())
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(anyhow!("{name} must be 0/1/true/false (got '{other}')")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`. Environment overrides
/// are applied afterwards, then the result is validated.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        Config::default()
    };
    cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
    cfg.validate()?;
    Ok(cfg)
}
