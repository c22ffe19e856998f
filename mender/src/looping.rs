//! Pass-loop orchestration: Discover → Assemble → Generate → Parse → Apply →
//! Gate → Finalize, bounded by `max_passes`.
//!
//! Each pass produces a typed [`PassOutcome`] that alone drives the next
//! transition. Free-text feedback from the most recent pass (and the operator
//! feedback file) is carried into the next request but never interpreted by
//! the loop itself.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tracing::{info, instrument, warn};

use crate::config::{Config, NoEditPolicy};
use crate::core::budget::{fit_to_budget, rough_tokens, shrink_to_chars, ShrinkableBlock};
use crate::core::outcome::{FatalKind, PassOutcome, RetryKind};
use crate::core::path::Allowlist;
use crate::core::protocol::{self, Reply};
use crate::io::apply::{apply_edits, ApplyFailure};
use crate::io::backend::{BackendError, ModelBackend, ModelReply, ModelRequest};
use crate::io::context::{assemble_context, ContextMode};
use crate::io::feedback::consume_feedback;
use crate::io::gate::{GateRequest, GateRunner};
use crate::io::git::Git;
use crate::io::report::{write_pass_artifacts, write_pass_meta, PassMeta, RunLog, StatePaths};
use crate::io::scan::{render_file_tree, scan_workspace};

/// Estimated template framing around the goal/context/feedback blocks.
const ENVELOPE_OVERHEAD_TOKENS: usize = 64;
/// Smallest useful context block; shrinking stops here.
const CONTEXT_FLOOR_CHARS: usize = 400;
const FEEDBACK_FLOOR_CHARS: usize = 200;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Gate green; edits committed (false when the tree had nothing to
    /// commit, e.g. the reply rewrote a file to identical content).
    Succeeded { passes: u32, committed: bool },
    /// The reply proposed no edits and the deployment accepts that.
    NoEditsNeeded { passes: u32 },
    /// All passes spent without a green gate.
    Exhausted { passes: u32 },
    /// A fatal outcome ended the run early.
    Aborted { kind: FatalKind, detail: String },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    /// Last model-reported plan/summary, for the run summary artifact.
    pub summary: Option<String>,
}

/// Immutable surroundings of one run, shared by every pass.
pub struct PassContext<'a> {
    pub root: &'a Path,
    pub git: &'a Git,
    pub allowlist: &'a Allowlist,
    pub config: &'a Config,
    pub goal: &'a str,
    pub run_id: &'a str,
    pub paths: &'a StatePaths,
    pub log: &'a RunLog,
}

/// Run the pass loop until a terminal outcome or `max_passes`.
#[instrument(skip_all, fields(run_id = ctx.run_id))]
pub fn run_loop<B: ModelBackend, G: GateRunner>(
    ctx: &PassContext<'_>,
    backend: &B,
    gate: &G,
) -> Result<LoopOutcome> {
    let config = ctx.config;
    let mut feedback: Option<String> = None;
    let mut mode = ContextMode::Full;
    let mut discovery_pending = config.discovery;
    let mut last_summary: Option<String> = None;

    for pass in 1..=config.max_passes {
        ctx.log.log(format!("pass {pass}/{}", config.max_passes));

        if let Some(note) = consume_feedback(&ctx.paths.feedback_path)? {
            ctx.log.log("consumed operator feedback");
            let note = shrink_to_chars(&note, config.feedback_max_bytes);
            feedback = Some(match feedback.take() {
                Some(prev) => format!("{prev}\n\nOperator note:\n{note}"),
                None => format!("Operator note:\n{note}"),
            });
        }

        let outcome = run_pass(
            ctx,
            backend,
            gate,
            pass,
            &mut mode,
            &mut discovery_pending,
            feedback.take(),
            &mut last_summary,
        )?;
        write_pass_meta(&ctx.paths.pass_dir(ctx.run_id, pass), &pass_meta(ctx, pass, &outcome))?;

        match outcome {
            PassOutcome::Success { summary } => {
                ctx.log.log("run succeeded");
                let committed = finalize_commit(ctx, &summary)?;
                if committed {
                    ctx.log.log("committed allowlisted changes");
                } else {
                    ctx.log.log("gate green but nothing to commit");
                }
                return Ok(LoopOutcome {
                    stop: LoopStop::Succeeded { passes: pass, committed },
                    summary: Some(summary),
                });
            }
            PassOutcome::NoEditsNeeded { summary } => {
                ctx.log.log("model proposed no edits; accepting as terminal");
                return Ok(LoopOutcome {
                    stop: LoopStop::NoEditsNeeded { passes: pass },
                    summary: Some(summary),
                });
            }
            PassOutcome::Fatal { kind, detail } => {
                ctx.log.log(format!("fatal ({kind:?}): {detail}"));
                return Ok(LoopOutcome {
                    stop: LoopStop::Aborted { kind, detail },
                    summary: last_summary,
                });
            }
            PassOutcome::Retry {
                kind,
                feedback: next,
            } => {
                ctx.log
                    .log(format!("pass {pass} failed ({kind:?}), carrying feedback"));
                info!(?kind, pass, "pass failed, retrying");
                feedback = Some(shrink_to_chars(&next, config.feedback_max_bytes));
            }
        }
    }

    ctx.log.log("max passes reached without a green gate");
    Ok(LoopOutcome {
        stop: LoopStop::Exhausted {
            passes: config.max_passes,
        },
        summary: last_summary,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_pass<B: ModelBackend, G: GateRunner>(
    ctx: &PassContext<'_>,
    backend: &B,
    gate: &G,
    pass: u32,
    mode: &mut ContextMode,
    discovery_pending: &mut bool,
    feedback: Option<String>,
    last_summary: &mut Option<String>,
) -> Result<PassOutcome> {
    let config = ctx.config;
    let scanned = scan_workspace(ctx.git, &config.ignore_segments)?;

    if *discovery_pending {
        *discovery_pending = false;
        match discover_files(ctx, backend, &scanned) {
            Ok(Some(selected)) => {
                ctx.log
                    .log(format!("discovery selected {} file(s)", selected.len()));
                *mode = ContextMode::Selected(selected);
            }
            Ok(None) => ctx.log.log("discovery selected nothing, using full context"),
            Err(err) => {
                warn!(err = %err, "discovery failed");
                ctx.log
                    .log(format!("discovery failed ({err:#}), using full context"));
            }
        }
    }

    let context_blob = assemble_context(ctx.root, &scanned, mode, config.max_read_bytes)?;
    let request = build_request(
        backend,
        ctx.goal,
        &context_blob,
        feedback.as_deref(),
        config,
    )?;

    let reply_text = match generate_with_retry(backend, request, config, ctx.log) {
        Ok(reply) => reply.text,
        Err(err) => {
            return Ok(PassOutcome::Retry {
                kind: RetryKind::Backend,
                feedback: format!(
                    "The previous attempt failed before any edit was made: {err}. \
                     Proceed with the original goal."
                ),
            });
        }
    };

    let pass_dir = ctx.paths.pass_dir(ctx.run_id, pass);
    write_pass_artifacts(&pass_dir, &reply_text, None)?;

    let reply = match protocol::parse_reply(&reply_text) {
        Ok(reply) => reply,
        Err(err) => {
            ctx.log.log(format!("malformed reply: {err}"));
            return Ok(PassOutcome::Retry {
                kind: RetryKind::Protocol,
                feedback: err.corrective_feedback(),
            });
        }
    };
    *last_summary = Some(render_reply_summary(&reply));

    if !reply.has_structure() {
        ctx.log.log("reply had no recognizable section");
        return Ok(PassOutcome::Retry {
            kind: RetryKind::Protocol,
            feedback: "Your reply did not contain any of the mandated sections. Respond \
                       with a '## Plan' section, EDIT directives (each followed by a \
                       fenced block with the full file content), and a '## Summary of \
                       Changes' section."
                .to_string(),
        });
    }

    if reply.edits.is_empty() {
        return Ok(match config.no_edit_policy {
            NoEditPolicy::Accept => PassOutcome::NoEditsNeeded {
                summary: render_reply_summary(&reply),
            },
            NoEditPolicy::Retry => PassOutcome::Retry {
                kind: RetryKind::Protocol,
                feedback: "Your reply contained no EDIT directive. This deployment \
                           requires at least one file edit per reply; provide the \
                           full new content of the files you change."
                    .to_string(),
            },
        });
    }

    let applied = apply_edits(ctx.root, ctx.allowlist, &reply.edits);
    for path in &applied.applied {
        ctx.log.log(format!("applied edit to {path}"));
    }

    if let Some(failure) = applied.failure {
        revert_pass(ctx, &applied.applied)?;
        return Ok(match failure {
            ApplyFailure::Sandbox(violation) => PassOutcome::Fatal {
                kind: FatalKind::Sandbox,
                detail: violation.to_string(),
            },
            ApplyFailure::Write {
                path,
                detail,
                fatal: true,
            } => PassOutcome::Fatal {
                kind: FatalKind::Write,
                detail: format!("write failed for '{path}': {detail}"),
            },
            ApplyFailure::Write {
                path,
                detail,
                fatal: false,
            } => PassOutcome::Retry {
                kind: RetryKind::Write,
                feedback: format!(
                    "Writing '{path}' failed: {detail}. The pass was rolled back; \
                     propose the edit again or choose another approach."
                ),
            },
        });
    }

    let report = gate.run(&GateRequest {
        root: ctx.root.to_path_buf(),
        steps: config.gate.steps.clone(),
        timeout: Duration::from_secs(config.command_timeout_secs),
        output_limit_bytes: config.output_limit_bytes,
    })?;
    write_pass_artifacts(&pass_dir, &reply_text, Some(&report))?;

    if report.passed() {
        ctx.log.log("gate GREEN");
        return Ok(PassOutcome::Success {
            summary: render_reply_summary(&reply),
        });
    }

    let failing = report
        .failure()
        .ok_or_else(|| anyhow!("failed gate report has no failing step"))?;
    ctx.log
        .log(format!("gate failed at '{}'", failing.command));
    revert_pass(ctx, &applied.applied)?;

    Ok(PassOutcome::Retry {
        kind: RetryKind::Gate,
        feedback: format!(
            "The build/test gate failed at '{}'. Captured output:\n{}",
            failing.command, failing.output
        ),
    })
}

/// Restore this pass's applied edits when reversion is enabled. Untracked
/// files created by the pass stay on disk (revert is undefined for them) and
/// are logged as anomalies.
fn revert_pass(ctx: &PassContext<'_>, applied: &[String]) -> Result<()> {
    if !ctx.config.revert_on_failure || applied.is_empty() {
        return Ok(());
    }
    let summary = ctx.git.revert_paths(applied)?;
    for path in &summary.reverted {
        ctx.log.log(format!("reverted {path}"));
    }
    for path in &summary.untracked {
        ctx.log.log(format!(
            "anomaly: '{path}' is untracked, left on disk (revert undefined)"
        ));
    }
    Ok(())
}

/// Stage and commit the allowlisted changes after a green gate.
fn finalize_commit(ctx: &PassContext<'_>, summary: &str) -> Result<bool> {
    let changed: Vec<String> = ctx
        .git
        .status_porcelain()?
        .into_iter()
        .map(|entry| entry.path)
        .filter(|path| {
            ctx.allowlist.permits(path)
                && path != ".mender"
                && !path.starts_with(".mender/")
        })
        .collect();
    if changed.is_empty() {
        return Ok(false);
    }
    ctx.git.stage_paths(&changed)?;

    let title: String = ctx.goal.chars().take(50).collect();
    let message = format!("mender: {title}\n\n{summary}\n\nRun: {}", ctx.run_id);
    ctx.git.commit_staged(&message)
}

/// One discovery request over the bare file tree; `None` when the model
/// selected nothing usable.
fn discover_files<B: ModelBackend>(
    ctx: &PassContext<'_>,
    backend: &B,
    scanned: &[String],
) -> Result<Option<Vec<String>>> {
    let request = ModelRequest {
        system: protocol::render_system()?,
        user: protocol::render_discover(ctx.goal, &render_file_tree(scanned))?,
    };
    let reply = generate_with_retry(backend, request, ctx.config, ctx.log)
        .map_err(|err| anyhow!("discovery request failed: {err}"))?;
    let selected = protocol::parse_discovery(&reply.text, scanned);
    Ok((!selected.is_empty()).then_some(selected))
}

/// Build the request envelope, fitting context and feedback to the token
/// budget. The rough estimate decides first; when the backend can count
/// exactly, the count is verified and the context shrunk further if needed.
fn build_request<B: ModelBackend>(
    backend: &B,
    goal: &str,
    context_blob: &str,
    feedback: Option<&str>,
    config: &Config,
) -> Result<ModelRequest> {
    let system = protocol::render_system()?;
    let mut blocks = [
        ShrinkableBlock {
            name: "context",
            text: context_blob.to_string(),
            floor_chars: CONTEXT_FLOOR_CHARS,
        },
        ShrinkableBlock {
            name: "feedback",
            text: feedback.unwrap_or_default().to_string(),
            floor_chars: FEEDBACK_FLOOR_CHARS,
        },
    ];
    let fixed = rough_tokens(&system) + rough_tokens(goal) + ENVELOPE_OVERHEAD_TOKENS;
    if !fit_to_budget(
        &mut blocks,
        fixed,
        config.token_budget,
        config.token_margin,
    ) {
        bail!("request cannot fit the token budget even at minimum context");
    }

    let render = |blocks: &[ShrinkableBlock]| -> Result<String> {
        protocol::render_request(
            goal,
            Some(blocks[0].text.as_str()).filter(|s| !s.is_empty()),
            Some(blocks[1].text.as_str()).filter(|s| !s.is_empty()),
        )
    };
    let mut user = render(&blocks)?;

    // Exact-count refinement when the backend supports it.
    let limit = config.token_budget - config.token_margin;
    for _ in 0..3 {
        let request = ModelRequest {
            system: system.clone(),
            user: user.clone(),
        };
        let Some(exact) = backend.count_tokens(&request) else {
            break;
        };
        if exact <= limit {
            break;
        }
        let chars = blocks[0].text.chars().count();
        if chars <= CONTEXT_FLOOR_CHARS {
            break;
        }
        blocks[0].text = shrink_to_chars(&blocks[0].text, (chars / 2).max(CONTEXT_FLOOR_CHARS));
        user = render(&blocks)?;
    }

    Ok(ModelRequest { system, user })
}

/// Call the backend, absorbing the retryable error kinds in-pass: rate limits
/// back off and retry, token overflow shrinks the user message and retries.
fn generate_with_retry<B: ModelBackend>(
    backend: &B,
    mut request: ModelRequest,
    config: &Config,
    log: &RunLog,
) -> std::result::Result<ModelReply, BackendError> {
    let mut attempt = 0u32;
    loop {
        match backend.generate(&request) {
            Ok(reply) => return Ok(reply),
            Err(BackendError::RateLimited { retry_after })
                if attempt < config.backend_max_retries =>
            {
                attempt += 1;
                let wait =
                    retry_after.unwrap_or_else(|| Duration::from_secs(2u64.saturating_pow(attempt)));
                log.log(format!(
                    "backend rate limited, backing off {}s (attempt {attempt}/{})",
                    wait.as_secs(),
                    config.backend_max_retries
                ));
                std::thread::sleep(wait);
            }
            Err(BackendError::TokenOverflow) if attempt < config.backend_max_retries => {
                attempt += 1;
                let chars = request.user.chars().count();
                request.user = shrink_to_chars(&request.user, (chars / 2).max(FEEDBACK_FLOOR_CHARS));
                log.log("token overflow, shrinking request and retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

/// The model-facing outcome record: plan and summary with placeholders, the
/// way the run summary artifact reports them.
fn render_reply_summary(reply: &Reply) -> String {
    format!(
        "Plan:\n{}\n\nSummary:\n{}",
        reply.plan.as_deref().unwrap_or("No plan was provided."),
        reply
            .summary
            .as_deref()
            .unwrap_or("No summary was provided.")
    )
}

fn pass_meta(ctx: &PassContext<'_>, pass: u32, outcome: &PassOutcome) -> PassMeta {
    let label = match outcome {
        PassOutcome::Success { .. } => "success",
        PassOutcome::NoEditsNeeded { .. } => "no-edits",
        PassOutcome::Retry { .. } => "retry",
        PassOutcome::Fatal { .. } => "fatal",
    };
    let retry = match outcome {
        PassOutcome::Retry { kind, .. } => Some(*kind),
        _ => None,
    };
    let fatal = match outcome {
        PassOutcome::Fatal { kind, .. } => Some(*kind),
        _ => None,
    };
    PassMeta {
        run_id: ctx.run_id.to_string(),
        pass,
        outcome: label.to_string(),
        retry,
        fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedBackend, ScriptedGate, TestRepo};

    fn context<'a>(
        repo: &'a TestRepo,
        git: &'a Git,
        allowlist: &'a Allowlist,
        config: &'a Config,
        paths: &'a StatePaths,
        log: &'a RunLog,
    ) -> PassContext<'a> {
        PassContext {
            root: repo.root(),
            git,
            allowlist,
            config,
            goal: "fix typo",
            run_id: "run-under-test",
            paths,
            log,
        }
    }

    fn setup(repo: &TestRepo) -> (StatePaths, RunLog) {
        let paths = StatePaths::new(repo.root());
        let log = RunLog::create(&paths.run_log_path("run-under-test")).expect("run log");
        (paths, log)
    }

    fn edit_reply(path: &str, content: &str) -> String {
        format!(
            "## Plan\nEdit {path}.\n\nEDIT {path}\n```\n{content}\n```\n\n## Summary of Changes\nEdited {path}.\n"
        )
    }

    #[test]
    fn green_gate_commits_on_first_pass() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = edit_reply("README.md", "fixed");
        let backend = ScriptedBackend::with_replies(&[reply.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Succeeded {
                passes: 1,
                committed: true
            }
        );
        assert_eq!(repo.read_file("README.md").expect("read"), "fixed");
        let head = repo.head_message().expect("head");
        assert!(head.contains("fix typo"));
        assert!(head.contains("run-under-test"));
    }

    #[test]
    fn malformed_reply_retries_then_succeeds() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let fixed = edit_reply("README.md", "fixed");
        let backend =
            ScriptedBackend::with_replies(&["I cannot help with that.", fixed.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Succeeded {
                passes: 2,
                committed: true
            }
        );
    }

    #[test]
    fn no_edit_reply_never_reaches_the_gate_when_accepted() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let backend = ScriptedBackend::with_replies(&[
            "## Plan\nNothing to do.\n\n## Summary of Changes\nAlready satisfied.\n",
        ]);
        // A consulted gate would fail; the accept policy must not consult it.
        let gate = ScriptedGate::new(vec![ScriptedGate::failing_report("build", "boom")]);

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(outcome.stop, LoopStop::NoEditsNeeded { passes: 1 });
        assert!(outcome.summary.expect("summary").contains("Already satisfied"));
    }

    #[test]
    fn no_edit_reply_retries_under_the_retry_policy() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            no_edit_policy: NoEditPolicy::Retry,
            max_passes: 2,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = "## Plan\nNothing to do.\n\n## Summary of Changes\nDone.\n";
        let backend = ScriptedBackend::with_replies(&[reply, reply]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Exhausted { passes: 2 });
    }

    #[test]
    fn escaping_edit_aborts_with_sandbox_fatal() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = edit_reply("../evil.txt", "nope");
        let backend = ScriptedBackend::with_replies(&[reply.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert!(matches!(
            outcome.stop,
            LoopStop::Aborted {
                kind: FatalKind::Sandbox,
                ..
            }
        ));
        assert!(!repo
            .root()
            .parent()
            .expect("parent")
            .join("evil.txt")
            .exists());
    }

    #[test]
    fn disallowed_path_aborts_with_sandbox_fatal() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec!["docs/".to_string()]);
        let config = Config {
            allowlist: vec!["docs/".to_string()],
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = edit_reply("src/main.rs", "nope");
        let backend = ScriptedBackend::with_replies(&[reply.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert!(matches!(
            outcome.stop,
            LoopStop::Aborted {
                kind: FatalKind::Sandbox,
                ..
            }
        ));
        assert!(!repo.root().join("src/main.rs").exists());
    }

    #[test]
    fn gate_failure_reverts_tracked_and_keeps_untracked() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            max_passes: 1,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = "## Plan\nTwo edits.\n\nEDIT README.md\n```\nbroken\n```\nEDIT extra.txt\n```\nnew file\n```\n\n## Summary of Changes\nEdited two files.\n";
        let backend = ScriptedBackend::with_replies(&[reply]);
        let gate = ScriptedGate::new(vec![ScriptedGate::failing_report(
            "cargo check",
            "error: broken",
        )]);

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Exhausted { passes: 1 });
        // Tracked file restored, untracked survivor stays.
        assert_eq!(repo.read_file("README.md").expect("read"), "hi\n");
        assert_eq!(repo.read_file("extra.txt").expect("read"), "new file\n");
    }

    #[test]
    fn gate_failure_feedback_names_the_failing_command() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            max_passes: 2,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let backend = ScriptedBackend::new(vec![
            Ok(ModelReply {
                text: edit_reply("README.md", "broken"),
            }),
            // Second pass fails at the backend so the loop exhausts; the
            // point of the test is the first pass's revert and artifacts.
            Err(BackendError::Service("down".to_string())),
        ]);
        let gate = ScriptedGate::new(vec![ScriptedGate::failing_report(
            "pnpm run build",
            "TypeError: boom",
        )]);

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Exhausted { passes: 2 });

        let gate_log = std::fs::read_to_string(
            paths.pass_dir("run-under-test", 1).join("gate.log"),
        )
        .expect("gate log");
        assert!(gate_log.contains("pnpm run build"));
        assert!(gate_log.contains("TypeError: boom"));
    }

    #[test]
    fn backend_errors_are_retried_across_passes_until_exhaustion() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            max_passes: 2,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let backend = ScriptedBackend::new(vec![
            Err(BackendError::Service("unreachable".to_string())),
            Err(BackendError::Service("unreachable".to_string())),
        ]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(outcome.stop, LoopStop::Exhausted { passes: 2 });
    }

    #[test]
    fn rate_limit_backs_off_and_retries_within_the_pass() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let backend = ScriptedBackend::new(vec![
            Err(BackendError::RateLimited {
                retry_after: Some(Duration::from_secs(0)),
            }),
            Ok(ModelReply {
                text: edit_reply("README.md", "fixed"),
            }),
        ]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Succeeded {
                passes: 1,
                committed: true
            }
        );
    }

    #[test]
    fn operator_feedback_is_consumed_once() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config::default();
        let (paths, log) = setup(&repo);
        std::fs::create_dir_all(&paths.state_dir).expect("state dir");
        std::fs::write(&paths.feedback_path, "try the parser module\n").expect("write");
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let reply = edit_reply("README.md", "fixed");
        let backend = ScriptedBackend::with_replies(&[reply.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert!(matches!(outcome.stop, LoopStop::Succeeded { .. }));
        assert!(!paths.feedback_path.exists());
    }

    #[test]
    fn build_request_shrinks_oversized_context() {
        let config = Config {
            token_budget: 2_000,
            token_margin: 100,
            ..Config::default()
        };
        let backend = ScriptedBackend::with_replies(&[]);
        let context_blob = "x".repeat(20_000);

        let request =
            build_request(&backend, "goal", &context_blob, None, &config).expect("build");
        assert!(request.user.contains("[... truncated ...]"));
        assert!(rough_tokens(&request.user) < 2_000);
    }

    #[test]
    fn build_request_honors_exact_counts() {
        let config = Config {
            token_budget: 10_000,
            token_margin: 100,
            ..Config::default()
        };
        // The exact count always exceeds the limit, so refinement shrinks the
        // context to its floor.
        let backend = ScriptedBackend::with_replies(&[]).reporting_tokens(usize::MAX);
        let context_blob = "y".repeat(8_000);

        let request =
            build_request(&backend, "goal", &context_blob, None, &config).expect("build");
        assert!(request.user.contains("[... truncated ...]"));
    }

    #[test]
    fn discovery_narrows_context_once_then_edits() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("src/lib.rs", "pub fn f() {}\n").expect("write");
        repo.commit_all("chore: add lib").expect("commit");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            discovery: true,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let edit = edit_reply("src/lib.rs", "pub fn f() -> u8 { 1 }");
        // First scripted reply answers the discovery request, the second is
        // the edit pass.
        let backend = ScriptedBackend::with_replies(&["src/lib.rs\n", edit.as_str()]);
        let gate = ScriptedGate::always_green();

        let outcome = run_loop(&ctx, &backend, &gate).expect("loop");
        assert_eq!(
            outcome.stop,
            LoopStop::Succeeded {
                passes: 1,
                committed: true
            }
        );
        assert_eq!(
            repo.read_file("src/lib.rs").expect("read"),
            "pub fn f() -> u8 { 1 }"
        );
    }

    #[test]
    fn every_pass_records_a_meta_artifact() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let allowlist = Allowlist::new(vec![String::new()]);
        let config = Config {
            max_passes: 1,
            ..Config::default()
        };
        let (paths, log) = setup(&repo);
        let ctx = context(&repo, &git, &allowlist, &config, &paths, &log);

        let backend = ScriptedBackend::with_replies(&["nonsense"]);
        let gate = ScriptedGate::always_green();
        run_loop(&ctx, &backend, &gate).expect("loop");

        let meta = std::fs::read_to_string(
            paths.pass_dir("run-under-test", 1).join("meta.json"),
        )
        .expect("meta");
        assert!(meta.contains("\"outcome\": \"retry\""));
        assert!(meta.contains("\"protocol\""));
    }
}
