//! Request envelope and reply grammar for the model exchange.
//!
//! The request side renders minijinja templates; the reply side is a small
//! line-anchored parser for the mandated structure: a `## Plan` section, zero
//! or more `EDIT <path>` directives each followed by a fenced block, and a
//! `## Summary of Changes` section. Parsing is tolerant about missing plan or
//! summary (recorded as absent), strict about directive shape.

use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{context, Environment};
use regex::Regex;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const REQUEST_TEMPLATE: &str = include_str!("prompts/request.md");
const DISCOVER_TEMPLATE: &str = include_str!("prompts/discover.md");

const PLAN_HEADER: &str = "## Plan";
const SUMMARY_HEADER: &str = "## Summary of Changes";

static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^EDIT ([A-Za-z0-9._/\-]+)\s*$").unwrap());
static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```[A-Za-z0-9_+\-]*\s*$").unwrap());

/// One proposed file replacement, in reply order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditDirective {
    /// Relative path as written in the directive line.
    pub path: String,
    /// Full intended file content.
    pub content: String,
}

/// Parsed model reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub plan: Option<String>,
    pub summary: Option<String>,
    pub edits: Vec<EditDirective>,
}

impl Reply {
    /// Whether the reply carried any recognizable section at all. A reply
    /// with none of plan, summary, or edits is malformed regardless of the
    /// no-edit policy.
    pub fn has_structure(&self) -> bool {
        self.plan.is_some() || self.summary.is_some() || !self.edits.is_empty()
    }
}

/// A reply that violated the directive grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `EDIT <path>` was not followed by an opening code fence.
    MissingFence { path: String },
    /// A directive's code fence never closed before end of reply.
    UnterminatedFence { path: String },
}

impl ProtocolError {
    /// Corrective instruction fed back to the model on the next pass.
    pub fn corrective_feedback(&self) -> String {
        match self {
            ProtocolError::MissingFence { path } => format!(
                "Your reply was malformed: the directive 'EDIT {path}' must be \
                 immediately followed by a fenced code block (``` ... ```) \
                 containing the full file content. Resend using the mandated \
                 structure: '## Plan', EDIT directives with fenced content, \
                 '## Summary of Changes'."
            ),
            ProtocolError::UnterminatedFence { path } => format!(
                "Your reply was malformed: the code fence for 'EDIT {path}' was \
                 never closed. Close every fenced block with ``` and resend \
                 using the mandated structure: '## Plan', EDIT directives with \
                 fenced content, '## Summary of Changes'."
            ),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::MissingFence { path } => {
                write!(f, "directive 'EDIT {path}' not followed by a code fence")
            }
            ProtocolError::UnterminatedFence { path } => {
                write!(f, "unterminated code fence for 'EDIT {path}'")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parse a model reply against the response contract.
pub fn parse_reply(text: &str) -> Result<Reply, ProtocolError> {
    let lines: Vec<&str> = text.lines().collect();
    let mut reply = Reply::default();
    let mut plan_lines: Vec<&str> = Vec::new();
    let mut summary_lines: Vec<&str> = Vec::new();

    enum Section {
        Preamble,
        Plan,
        Summary,
    }
    let mut section = Section::Preamble;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if line.trim_end() == PLAN_HEADER {
            section = Section::Plan;
            i += 1;
            continue;
        }
        if line.trim_end() == SUMMARY_HEADER {
            section = Section::Summary;
            i += 1;
            continue;
        }

        if let Some(caps) = DIRECTIVE_RE.captures(line) {
            let path = caps[1].to_string();
            // The fence must open on the next non-blank line.
            let mut j = i + 1;
            while j < lines.len() && lines[j].trim().is_empty() {
                j += 1;
            }
            if j >= lines.len() || !FENCE_OPEN_RE.is_match(lines[j]) {
                return Err(ProtocolError::MissingFence { path });
            }
            let content_start = j + 1;
            let mut end = None;
            for (k, candidate) in lines.iter().enumerate().skip(content_start) {
                if candidate.trim_end() == "```" {
                    end = Some(k);
                    break;
                }
            }
            let Some(end) = end else {
                return Err(ProtocolError::UnterminatedFence { path });
            };
            let content = lines[content_start..end].join("\n");
            reply.edits.push(EditDirective { path, content });
            section = Section::Preamble;
            i = end + 1;
            continue;
        }

        match section {
            Section::Plan => plan_lines.push(line),
            Section::Summary => summary_lines.push(line),
            Section::Preamble => {}
        }
        i += 1;
    }

    reply.plan = collect_section(&plan_lines);
    reply.summary = collect_section(&summary_lines);
    Ok(reply)
}

fn collect_section(lines: &[&str]) -> Option<String> {
    let joined = lines.join("\n").trim().to_string();
    if joined.is_empty() { None } else { Some(joined) }
}

/// Parse a discovery reply into repository paths.
///
/// One path per line; leading bullets and surrounding backticks are
/// tolerated; anything not present in `known_files` is dropped. Order follows
/// the reply, duplicates collapse to the first occurrence.
pub fn parse_discovery(text: &str, known_files: &[String]) -> Vec<String> {
    let known: HashSet<&str> = known_files.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for line in text.lines() {
        let candidate = line
            .trim()
            .trim_start_matches(['-', '*'])
            .trim()
            .trim_matches('`')
            .trim();
        if candidate.is_empty() {
            continue;
        }
        if known.contains(candidate) && seen.insert(candidate.to_string()) {
            selected.push(candidate.to_string());
        }
    }
    selected
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("request", REQUEST_TEMPLATE)
            .expect("request template should be valid");
        env.add_template("discover", DISCOVER_TEMPLATE)
            .expect("discover template should be valid");
        Self { env }
    }
}

/// The system instruction: role, hard rules, mandated reply structure.
pub fn render_system() -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("system")?;
    template.render(context! {}).context("render system prompt")
}

/// The user message for an edit pass: goal plus optional context and feedback.
pub fn render_request(goal: &str, repo_context: Option<&str>, feedback: Option<&str>) -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("request")?;
    template
        .render(context! {
            goal => goal.trim(),
            context => repo_context.map(str::trim).filter(|s| !s.is_empty()),
            feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
        })
        .context("render request prompt")
}

/// The user message for the one-time discovery request over the bare tree.
pub fn render_discover(goal: &str, file_tree: &str) -> Result<String> {
    let engine = PromptEngine::new();
    let template = engine.env.get_template("discover")?;
    template
        .render(context! {
            goal => goal.trim(),
            file_tree => file_tree.trim(),
        })
        .context("render discover prompt")
}
