//! Gate runner: the ordered external validation pipeline.
//!
//! Steps execute sequentially; the first non-zero exit (or timeout) fails the
//! gate and the remaining steps never run. The failing step's captured output
//! becomes the feedback for the next pass. A deployment with zero steps has a
//! gate that is always green.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::config::GateStep;
use crate::core::outcome::{GateReport, GateStepReport};
use crate::io::process::run_command_with_timeout;

/// Parameters for one gate run.
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Project root; step workdirs resolve against it.
    pub root: PathBuf,
    /// Ordered pipeline steps.
    pub steps: Vec<GateStep>,
    /// Wall-clock ceiling per step.
    pub timeout: Duration,
    /// Captured output cap per step.
    pub output_limit_bytes: usize,
}

/// Abstraction over gate execution; tests script the report directly.
pub trait GateRunner {
    fn run(&self, request: &GateRequest) -> Result<GateReport>;
}

/// Gate runner that executes the configured commands.
pub struct CommandGateRunner;

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(steps = request.steps.len()))]
    fn run(&self, request: &GateRequest) -> Result<GateReport> {
        let mut report = GateReport::default();

        for step in &request.steps {
            let command_line = step.argv.join(" ");
            let workdir = resolve_workdir(&request.root, step.workdir.as_deref());
            info!(command = %command_line, "running gate step");

            let mut cmd = Command::new(&step.argv[0]);
            cmd.args(&step.argv[1..]).current_dir(&workdir);

            let step_report = match run_command_with_timeout(
                cmd,
                request.timeout,
                request.output_limit_bytes,
            ) {
                Ok(output) => GateStepReport {
                    command: command_line.clone(),
                    success: output.success(),
                    output: output.render(),
                },
                // A step we cannot even spawn fails the gate like any other
                // step failure; the reason lands in the captured output.
                Err(err) => GateStepReport {
                    command: command_line.clone(),
                    success: false,
                    output: format!("failed to run: {err:#}"),
                },
            };

            let success = step_report.success;
            report.steps.push(step_report);
            if !success {
                warn!(command = %command_line, "gate step failed, skipping the rest");
                return Ok(report);
            }
            debug!(command = %command_line, "gate step passed");
        }

        Ok(report)
    }
}

fn resolve_workdir(root: &Path, workdir: Option<&str>) -> PathBuf {
    match workdir {
        Some(rel) => root.join(rel),
        None => root.to_path_buf(),
    }
}
