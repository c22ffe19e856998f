//! CLI entry point: one positional goal, everything else configured through
//! `.mender/config.toml` and `MENDER_*` environment overrides.

use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use clap::Parser;

use mender::exit_codes;

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    about = "Autonomous code-modification loop: edit, validate, commit or retry"
)]
struct Cli {
    /// Natural-language goal for this run.
    #[arg(required = true)]
    goal: Vec<String>,

    /// Config file path (default: .mender/config.toml in the project root).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    mender::logging::init();
    match run() {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let goal = cli.goal.join(" ");
    let root = std::env::current_dir().context("resolve current directory")?;
    mender::run::execute(&root, &goal, cli.config.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_goal_words() {
        let cli = Cli::parse_from(["mender", "fix", "the", "typo"]);
        assert_eq!(cli.goal.join(" "), "fix the typo");
        assert!(cli.config.is_none());
    }

    #[test]
    fn parses_config_override() {
        let cli = Cli::parse_from(["mender", "--config", "alt.toml", "goal"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("alt.toml")));
    }
}
