//! Run coordination: identity, single-instance lock, artifacts, loop entry,
//! and the ship handoff.
//!
//! A run owns the process from lock acquisition to exit code. The lock guard
//! is scoped to this function so every exit path (success, failure, or an
//! error unwinding out) releases it.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{load_config, Config};
use crate::core::path::Allowlist;
use crate::exit_codes;
use crate::io::backend::{HttpBackend, ModelBackend};
use crate::io::gate::{CommandGateRunner, GateRunner};
use crate::io::git::Git;
use crate::io::lock::{LockContended, RunLock};
use crate::io::report::{prune_reports, write_next_steps, write_summary, RunLog, StatePaths};
use crate::looping::{run_loop, LoopStop, PassContext};
use crate::release::{read_version, run_release, ReleaseOutcome};

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Derive the run id from the wall clock, ship flag, and goal slug.
fn make_run_id(goal: &str, ship: bool, stamp: &str) -> String {
    let slug = SLUG_RE
        .replace_all(&goal.to_lowercase(), "-")
        .trim_matches('-')
        .chars()
        .take(40)
        .collect::<String>();
    let slug = if slug.is_empty() {
        "run".to_string()
    } else {
        slug.trim_end_matches('-').to_string()
    };
    format!("{stamp}-ship{}-{slug}", u8::from(ship))
}

/// Entry point for the CLI: load config, wire the real collaborators, run.
pub fn execute(root: &Path, goal: &str, config_override: Option<&Path>) -> Result<i32> {
    let paths = StatePaths::new(root);
    let config_path = config_override.unwrap_or(paths.config_path.as_path());
    let config = load_config(config_path)?;

    let backend = HttpBackend::from_config(&config.backend)?;
    execute_with(root, goal, config, &backend, &CommandGateRunner)
}

/// Run with injected collaborators (the seam the tests drive).
pub fn execute_with<B: ModelBackend, G: GateRunner>(
    root: &Path,
    goal: &str,
    config: Config,
    backend: &B,
    gate: &G,
) -> Result<i32> {
    let paths = StatePaths::new(root);

    let lock = match RunLock::acquire(&paths.lock_path) {
        Ok(lock) => lock,
        Err(err) if err.downcast_ref::<LockContended>().is_some() => {
            eprintln!("another run is active for this checkout; exiting");
            return Ok(exit_codes::LOCKED);
        }
        Err(err) => return Err(err),
    };

    if let Err(err) = prune_reports(&paths.reports_dir, config.reports_keep) {
        warn!(err = %err, "could not prune old reports");
    }

    let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
    let run_id = make_run_id(goal, config.ship, &stamp);
    let log = RunLog::create(&paths.run_log_path(&run_id))
        .with_context(|| format!("open run log for {run_id}"))?;
    log.log(format!("run {run_id} starting"));
    log.log(format!("goal: {goal}"));
    log.log(format!(
        "ship={} revert_on_failure={} max_passes={}",
        config.ship, config.revert_on_failure, config.max_passes
    ));
    if let Ok(version) = read_version(root, &config.version_file) {
        log.log(format!("current version: {version}"));
    }
    info!(run_id = %run_id, "run starting");

    let git = Git::new(root);
    let allowlist = Allowlist::new(config.allowlist.clone());
    let ctx = PassContext {
        root,
        git: &git,
        allowlist: &allowlist,
        config: &config,
        goal,
        run_id: &run_id,
        paths: &paths,
        log: &log,
    };

    let outcome = run_loop(&ctx, backend, gate)?;
    if let Some(summary) = &outcome.summary {
        write_summary(&paths.summary_path(&run_id), &run_id, summary)?;
    }

    let exit_code = match outcome.stop {
        LoopStop::Succeeded { passes, .. } => {
            let ship_note = if config.ship {
                match run_release(root, &git, &config, &allowlist, &log)? {
                    ReleaseOutcome::Shipped { version } => format!("shipped v{version}"),
                    ReleaseOutcome::Failed { last_tried, detail } => {
                        // The change is committed; a failed publish is not a
                        // failed run.
                        log.log(format!("ship failed after retries: {detail}"));
                        format!("ship failed (last tried v{last_tried}); change is committed locally")
                    }
                }
            } else {
                "ship disabled".to_string()
            };
            write_next_steps(
                &paths.next_steps_path,
                &format!(
                    "Run {run_id} succeeded after {passes} pass(es); {ship_note}.\n\
                     Review the commit and leave notes in .mender/feedback.txt to steer the next run.\n"
                ),
            )?;
            log.log("run finished");
            exit_codes::OK
        }
        LoopStop::NoEditsNeeded { passes } => {
            write_next_steps(
                &paths.next_steps_path,
                &format!(
                    "Run {run_id} ended after {passes} pass(es): the model reported no edit \
                     was needed. See the summary under .mender/reports/.\n"
                ),
            )?;
            log.log("run finished (no edits needed)");
            exit_codes::OK
        }
        LoopStop::Exhausted { passes } => {
            write_next_steps(
                &paths.next_steps_path,
                &format!(
                    "Run {run_id} stopped after {passes} pass(es) without a green gate.\n\
                     Inspect .mender/reports/{run_id}.log, then add guidance to \
                     .mender/feedback.txt and rerun.\n"
                ),
            )?;
            log.log("run finished (exhausted)");
            exit_codes::EXHAUSTED
        }
        LoopStop::Aborted { kind, detail } => {
            write_next_steps(
                &paths.next_steps_path,
                &format!(
                    "Run {run_id} aborted ({kind:?}): {detail}\n\
                     This needs operator attention before another run is useful.\n"
                ),
            )?;
            log.log("run finished (aborted)");
            exit_codes::INVALID
        }
    };

    drop(lock);
    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_stamp_ship_slug() {
        let id = make_run_id("Fix the Parser!", true, "20260806-120000");
        assert_eq!(id, "20260806-120000-ship1-fix-the-parser");
    }

    #[test]
    fn run_id_slug_falls_back_for_empty_goal() {
        let id = make_run_id("!!!", false, "20260806-120000");
        assert_eq!(id, "20260806-120000-ship0-run");
    }

    #[test]
    fn run_id_slug_is_bounded() {
        let goal = "a".repeat(200);
        let id = make_run_id(&goal, false, "20260806-120000");
        assert!(id.len() <= "20260806-120000-ship0-".len() + 40);
    }
}
