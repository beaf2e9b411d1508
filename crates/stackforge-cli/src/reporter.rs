use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use stackforge_installer::{RestoreReport, UpdatePhase, UpdatePlan, UpdateReporter};

use crate::render::{TerminalRenderer, TerminalSpinner};

pub(crate) struct CliReporter {
    renderer: TerminalRenderer,
    verbose: bool,
    assume_yes: bool,
    download: Option<TerminalSpinner>,
}

impl CliReporter {
    pub(crate) fn new(renderer: TerminalRenderer, verbose: bool, assume_yes: bool) -> Self {
        Self {
            renderer,
            verbose,
            assume_yes,
            download: None,
        }
    }

    pub(crate) fn finish(&mut self) {
        if let Some(spinner) = self.download.take() {
            spinner.finish_abandon();
        }
    }
}

impl UpdateReporter for CliReporter {
    fn phase_reached(&mut self, phase: UpdatePhase, detail: &str) {
        match phase {
            UpdatePhase::BackedUp => {
                self.renderer
                    .print_status("ok", &format!("backup saved to {detail}"));
                self.download = Some(self.renderer.start_spinner("download"));
                return;
            }
            UpdatePhase::Fetched => {
                if let Some(spinner) = self.download.take() {
                    spinner.finish_success();
                }
            }
            UpdatePhase::RollingBack => {
                self.finish();
                self.renderer.eprint_status(
                    "warn",
                    &format!("update failed; restoring previous installation from {detail}"),
                );
                return;
            }
            UpdatePhase::Failed => {
                self.finish();
                return;
            }
            _ => {}
        }

        if self.verbose {
            let message = if detail.is_empty() {
                phase.to_string()
            } else {
                format!("{phase}: {detail}")
            };
            self.renderer.print_status("..", &message);
        }
    }

    fn interrupted_update_restored(&mut self, report: &RestoreReport) {
        self.renderer.eprint_status(
            "warn",
            &format!(
                "an earlier update was interrupted; restored {} before continuing",
                report.backup_dir.display()
            ),
        );
    }

    fn confirm(&mut self, plan: &UpdatePlan) -> Result<bool> {
        let headline = if plan.forced {
            format!("reinstall stackforge {} (forced, currently {})", plan.target, plan.current)
        } else {
            format!("update stackforge {} -> {}", plan.current, plan.target)
        };
        self.renderer.print_status("..", &headline);
        if self.verbose {
            self.renderer.print_lines(&format_plan_steps(plan));
        }
        if self.assume_yes {
            return Ok(true);
        }

        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stderr();
        prompt_yes_no(&mut input, &mut output, "Proceed?")
    }
}

pub(crate) fn format_plan_steps(plan: &UpdatePlan) -> Vec<String> {
    plan.steps
        .iter()
        .enumerate()
        .map(|(index, step)| format!("  {}. {step}", index + 1))
        .collect()
}

pub(crate) fn prompt_yes_no<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
) -> Result<bool> {
    write!(output, "{question} [y/N] ").context("failed to write prompt")?;
    output.flush().context("failed to flush prompt")?;

    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
