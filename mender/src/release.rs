//! Release workflow: version bump, commit, push, and tag with conflict
//! retries.
//!
//! Runs only after a green gate and only when shipping is enabled. Every
//! retry strictly increases the patch component, so no version is ever reused
//! within a run regardless of how the conflict arose (rejected push or
//! colliding tag). Failure here is reported, not fatal: the code change is
//! already committed locally.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::core::path::Allowlist;
use crate::core::version::Version;
use crate::io::git::Git;
use crate::io::report::RunLog;

/// How a release attempt sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Shipped { version: Version },
    Failed { last_tried: Version, detail: String },
}

/// Read the current version from the configured version file.
pub fn read_version(root: &Path, version_file: &str) -> Result<Version> {
    let path = root.join(version_file);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read version file {}", path.display()))?;
    contents
        .parse()
        .with_context(|| format!("parse version file {}", path.display()))
}

/// Write a version into the configured version file (with trailing newline).
pub fn write_version(root: &Path, version_file: &str, version: Version) -> Result<()> {
    let path = root.join(version_file);
    fs::write(&path, format!("{version}\n"))
        .with_context(|| format!("write version file {}", path.display()))
}

/// Bump → commit → push → tag, restarting with the next patch on conflicts.
#[instrument(skip_all, fields(branch = %config.branch))]
pub fn run_release(
    root: &Path,
    git: &Git,
    config: &Config,
    allowlist: &Allowlist,
    log: &RunLog,
) -> Result<ReleaseOutcome> {
    let start = read_version(root, &config.version_file)?;
    let mut version = start.next_patch();

    for attempt in 1..=config.release_max_attempts {
        log.log(format!(
            "ship attempt {attempt}/{} for v{version}",
            config.release_max_attempts
        ));
        write_version(root, &config.version_file, version)?;

        let to_stage = changed_release_paths(git, allowlist, config)?;
        git.stage_paths(&to_stage)?;
        let committed = git.commit_staged(&format!("release: v{version}"))?;
        if !committed {
            // Possible when a previous attempt already committed this tree;
            // pushing HEAD is still the right move.
            log.log("nothing new to commit for this attempt");
        }

        let mut push = git.push_head(&config.branch)?;
        if !push.ok {
            log.log("push rejected; pull-rebase once and retry");
            let rebase = git.pull_rebase(&config.branch)?;
            if !rebase.ok {
                warn!(output = %rebase.output, "pull-rebase failed");
            }
            push = git.push_head(&config.branch)?;
            if !push.ok {
                log.log(format!(
                    "push rejected again ({}), bumping patch",
                    first_line(&push.output)
                ));
                version = version.next_patch();
                continue;
            }
        }

        let tag = format!("v{version}");
        let created = git.tag_annotated(&tag, &format!("Release {tag}"))?;
        if !created.ok {
            log.log(format!("tag {tag} already exists locally, bumping patch"));
            let _ = git.delete_local_tag(&tag)?;
            version = version.next_patch();
            continue;
        }
        let pushed = git.push_tag(&tag)?;
        if !pushed.ok {
            log.log(format!(
                "tag {tag} rejected by remote ({}), bumping patch",
                first_line(&pushed.output)
            ));
            let _ = git.delete_local_tag(&tag)?;
            version = version.next_patch();
            continue;
        }

        info!(version = %version, "shipped");
        log.log(format!("shipped v{version} to {}", config.branch));
        return Ok(ReleaseOutcome::Shipped { version });
    }

    Ok(ReleaseOutcome::Failed {
        last_tried: version,
        detail: format!(
            "release not published after {} attempts",
            config.release_max_attempts
        ),
    })
}

/// Paths to stage for a release commit: the version file, changed allowlisted
/// files, and the lockfile when configured and changed.
fn changed_release_paths(
    git: &Git,
    allowlist: &Allowlist,
    config: &Config,
) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for entry in git.status_porcelain()? {
        let path = entry.path;
        if path == ".mender" || path.starts_with(".mender/") {
            continue;
        }
        let is_version_file = path == config.version_file;
        let is_lockfile = config.lockfile.as_deref() == Some(path.as_str());
        if is_version_file || is_lockfile || allowlist.permits(&path) {
            paths.push(path);
        }
    }
    Ok(paths)
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::report::StatePaths;
    use crate::test_support::TestRepo;
    use std::process::Command;

    fn run_log(repo: &TestRepo) -> RunLog {
        let paths = StatePaths::new(repo.root());
        RunLog::create(&paths.run_log_path("release-test")).expect("run log")
    }

    fn allow_all() -> Allowlist {
        Allowlist::new(vec![String::new()])
    }

    /// Wire a bare sibling repository as `origin`.
    fn add_origin(repo: &TestRepo) -> tempfile::TempDir {
        let remote = tempfile::tempdir().expect("remote dir");
        let status = Command::new("git")
            .args(["init", "--bare"])
            .current_dir(remote.path())
            .output()
            .expect("git init --bare");
        assert!(status.status.success());
        let status = Command::new("git")
            .args([
                "remote",
                "add",
                "origin",
                remote.path().to_str().expect("utf8 path"),
            ])
            .current_dir(repo.root())
            .output()
            .expect("git remote add");
        assert!(status.status.success());
        remote
    }

    fn remote_has_tag(remote: &Path, tag: &str) -> bool {
        let out = Command::new("git")
            .args(["tag", "--list", tag])
            .current_dir(remote)
            .output()
            .expect("git tag --list");
        !String::from_utf8_lossy(&out.stdout).trim().is_empty()
    }

    #[test]
    fn release_staging_covers_version_file_and_lockfile_outside_allowlist() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("VERSION", "1.0.0\n").expect("write");
        repo.write_file("Cargo.lock", "# lock\n").expect("write");
        repo.write_file("docs/guide.md", "guide\n").expect("write");
        repo.write_file("src/lib.rs", "pub fn f() {}\n").expect("write");

        let git = repo.git();
        let config = Config {
            allowlist: vec!["docs/".to_string()],
            lockfile: Some("Cargo.lock".to_string()),
            ..Config::default()
        };
        let allowlist = Allowlist::new(config.allowlist.clone());

        let mut paths = changed_release_paths(&git, &allowlist, &config).expect("paths");
        paths.sort();
        assert_eq!(paths, vec!["Cargo.lock", "VERSION", "docs/guide.md"]);
    }

    #[test]
    fn version_file_round_trips() {
        let repo = TestRepo::new().expect("repo");
        write_version(repo.root(), "VERSION", Version::new(1, 2, 3)).expect("write");
        let read = read_version(repo.root(), "VERSION").expect("read");
        assert_eq!(read, Version::new(1, 2, 3));
    }

    #[test]
    fn ships_first_attempt_against_a_clean_remote() {
        let repo = TestRepo::new().expect("repo");
        let _remote = add_origin(&repo);
        repo.write_file("VERSION", "1.0.0\n").expect("seed version");
        repo.commit_all("chore: version file").expect("commit");

        let git = repo.git();
        let log = run_log(&repo);
        let outcome = run_release(
            repo.root(),
            &git,
            &Config::default(),
            &allow_all(),
            &log,
        )
        .expect("release");

        assert_eq!(
            outcome,
            ReleaseOutcome::Shipped {
                version: Version::new(1, 0, 1)
            }
        );
        assert_eq!(
            repo.read_file("VERSION").expect("read").trim(),
            "1.0.1"
        );
        assert!(remote_has_tag(_remote.path(), "v1.0.1"));
    }

    #[test]
    fn tag_collision_bumps_to_the_next_patch() {
        let repo = TestRepo::new().expect("repo");
        let remote = add_origin(&repo);
        repo.write_file("VERSION", "1.0.0\n").expect("seed version");
        repo.commit_all("chore: version file").expect("commit");

        // Publish v1.0.1 out-of-band so the first attempt collides.
        for args in [
            ["tag", "-a", "v1.0.1", "-m", "taken"].as_slice(),
            ["push", "origin", "v1.0.1"].as_slice(),
            ["tag", "-d", "v1.0.1"].as_slice(),
        ] {
            let out = Command::new("git")
                .args(args)
                .current_dir(repo.root())
                .output()
                .expect("git");
            assert!(out.status.success(), "git {args:?} failed");
        }

        let git = repo.git();
        let log = run_log(&repo);
        let outcome = run_release(
            repo.root(),
            &git,
            &Config::default(),
            &allow_all(),
            &log,
        )
        .expect("release");

        assert_eq!(
            outcome,
            ReleaseOutcome::Shipped {
                version: Version::new(1, 0, 2)
            }
        );
        assert!(remote_has_tag(remote.path(), "v1.0.2"));
        assert_eq!(
            repo.read_file("VERSION").expect("read").trim(),
            "1.0.2"
        );
    }

    #[test]
    fn exhausted_attempts_report_failure_without_version_reuse() {
        let repo = TestRepo::new().expect("repo");
        // No origin configured: every push is rejected.
        repo.write_file("VERSION", "2.1.0\n").expect("seed version");
        repo.commit_all("chore: version file").expect("commit");

        let git = repo.git();
        let log = run_log(&repo);
        let config = Config {
            release_max_attempts: 3,
            ..Config::default()
        };
        let outcome = run_release(repo.root(), &git, &config, &allow_all(), &log)
            .expect("release");

        match outcome {
            ReleaseOutcome::Failed { last_tried, .. } => {
                // Three attempts tried 2.1.1, 2.1.2, 2.1.3; the next candidate
                // proves strict monotonic growth.
                assert_eq!(last_tried, Version::new(2, 1, 4));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let on_disk = read_version(repo.root(), "VERSION").expect("read");
        assert!(on_disk > Version::new(2, 1, 0));
    }
}
