//! Run events and their presentation
//!
//! The runner never prints. It emits [`RunEvent`]s to a [`Reporter`], which
//! decides how (and whether) to show them.

use std::io::Write;
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::scoring::{ScenarioResult, Verdict};
use crate::teardown::TeardownReport;

/// Scenario phases, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Action,
    Assertion,
    Teardown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Setup => "Setup",
            Phase::Action => "Actions",
            Phase::Assertion => "Assertions",
            Phase::Teardown => "Teardown",
        };
        f.write_str(s)
    }
}

/// Everything observable about a scenario run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    ScenarioStarted {
        scenario: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        participants: Vec<String>,
        run_dir: String,
    },
    PhaseStarted {
        phase: Phase,
    },
    ClientStarted {
        client: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Step {
        phase: Phase,
        index: usize,
        description: String,
    },
    CommandIssued {
        client: String,
        command: String,
    },
    CommandFailed {
        client: String,
        command: String,
        reason: String,
    },
    WaitStarted {
        label: String,
        secs: f64,
    },
    WaitFinished,
    FactBound {
        name: String,
        value: String,
    },
    StepSkipped {
        index: usize,
        reason: String,
    },
    SetupFailed {
        reason: String,
    },
    AssertionEvaluated {
        description: String,
        passed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Interrupted,
    TeardownFinished {
        report: TeardownReport,
    },
    ScenarioFinished {
        result: ScenarioResult,
    },
}

impl RunEvent {
    pub fn wait(label: impl Into<String>, duration: Duration) -> Self {
        RunEvent::WaitStarted {
            label: label.into(),
            secs: duration.as_secs_f64(),
        }
    }
}

/// Sink for run events
pub trait Reporter {
    fn emit(&mut self, event: &RunEvent);
}

/// Human-readable, colored console output
pub struct ConsoleReporter {
    verbose: bool,
    spinner: Option<ProgressBar>,
}

impl ConsoleReporter {
    /// `verbose` also prints every command issued
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            spinner: None,
        }
    }

    fn start_spinner(&mut self, label: &str, secs: f64) {
        self.stop_spinner();
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg} ({elapsed})") {
            pb.set_style(style);
        }
        pb.set_message(format!("{label} [{secs:.1}s]"));
        pb.enable_steady_tick(Duration::from_millis(100));
        self.spinner = Some(pb);
    }

    fn stop_spinner(&mut self) {
        if let Some(pb) = self.spinner.take() {
            pb.finish_and_clear();
        }
    }

    fn print_result(result: &ScenarioResult) {
        println!();
        let score = format!("Score: {}", result.score());
        let line = match result.verdict {
            Verdict::Success => format!("{} {}", "✓".green().bold(), score.green().bold()),
            Verdict::PartialSuccess => format!(
                "{} {} (threshold {})",
                "~".yellow().bold(),
                score.yellow().bold(),
                result.threshold.unwrap_or(result.total)
            ),
            Verdict::Failure => format!("{} {}", "✗".red().bold(), score.red().bold()),
        };
        println!("{line}");
        let verdict = match result.verdict {
            Verdict::Success => result.verdict.to_string().green().bold(),
            Verdict::PartialSuccess => result.verdict.to_string().yellow().bold(),
            Verdict::Failure => result.verdict.to_string().red().bold(),
        };
        println!("{} {}", verdict, result.scenario);
    }
}

impl Reporter for ConsoleReporter {
    fn emit(&mut self, event: &RunEvent) {
        if !matches!(event, RunEvent::WaitFinished) {
            self.stop_spinner();
        }
        match event {
            RunEvent::ScenarioStarted {
                scenario,
                description,
                participants,
                run_dir,
            } => {
                println!("{} {}", "Scenario:".bold(), scenario.cyan().bold());
                if let Some(desc) = description {
                    println!("  {}", desc.dimmed());
                }
                println!("  Participants: {}", participants.join(", "));
                println!("  Run dir: {}", run_dir.dimmed());
            }
            RunEvent::PhaseStarted { phase } => {
                println!("\n{}", format!("{phase}:").cyan());
            }
            RunEvent::ClientStarted { client, port, pid } => {
                let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into());
                println!(
                    "  {} {} on port {} {}",
                    "✓".green(),
                    client,
                    port,
                    format!("(pid {pid})").dimmed()
                );
            }
            RunEvent::Step { index, description, .. } => {
                println!("  {} {}", format!("[{index}]").dimmed(), description);
            }
            RunEvent::CommandIssued { client, command } => {
                if self.verbose {
                    println!("      {} {}", format!("{client}>").dimmed(), command.dimmed());
                }
            }
            RunEvent::CommandFailed {
                client,
                command,
                reason,
            } => {
                println!(
                    "      {} {}: {} ({})",
                    "!".yellow(),
                    client,
                    command,
                    reason.yellow()
                );
            }
            RunEvent::WaitStarted { label, secs } => self.start_spinner(label, *secs),
            RunEvent::WaitFinished => self.stop_spinner(),
            RunEvent::FactBound { name, value } => {
                println!("      {} = {}", name.dimmed(), value);
            }
            RunEvent::StepSkipped { index, reason } => {
                println!("  {} Step {} skipped: {}", "-".yellow(), index, reason.yellow());
            }
            RunEvent::SetupFailed { reason } => {
                println!("  {} {}", "✗".red(), reason.red());
            }
            RunEvent::AssertionEvaluated {
                description,
                passed,
                detail,
            } => {
                let mark = if *passed { "✓".green() } else { "✗".red() };
                match detail {
                    Some(detail) if !passed => {
                        println!("  {} {} {}", mark, description, format!("({detail})").dimmed())
                    }
                    _ => println!("  {mark} {description}"),
                }
            }
            RunEvent::Interrupted => {
                println!("\n{}", "Interrupted, tearing down".yellow().bold());
            }
            RunEvent::TeardownFinished { report } => {
                println!(
                    "  Stopped {} engine(s): {} graceful, {} forced, {} already exited",
                    report.total(),
                    report.graceful.len(),
                    report.forced.len(),
                    report.crashed.len()
                );
            }
            RunEvent::ScenarioFinished { result } => {
                if let Some(err) = &result.setup_error {
                    println!("\n{} {}", "Setup failed:".red().bold(), err);
                }
                Self::print_result(result);
                println!();
            }
        }
    }
}

impl Drop for ConsoleReporter {
    fn drop(&mut self) {
        self.stop_spinner();
    }
}

/// One JSON object per line
pub struct JsonReporter<W: Write> {
    out: W,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn emit(&mut self, event: &RunEvent) {
        // Spinner bookkeeping has no meaning in a machine-readable stream
        if matches!(event, RunEvent::WaitFinished) {
            return;
        }
        let written = serde_json::to_writer(&mut self.out, event)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.out))
            .and_then(|()| self.out.flush());
        if let Err(e) = written {
            tracing::warn!("Failed to write event: {e}");
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Vec<RunEvent>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    /// Assertion outcomes in evaluation order
    pub fn assertions(&self) -> Vec<(&str, bool)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                RunEvent::AssertionEvaluated {
                    description, passed, ..
                } => Some((description.as_str(), *passed)),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn emit(&mut self, event: &RunEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::AssertionScorer;

    #[test]
    fn test_json_lines_are_tagged() {
        let mut buf = Vec::new();
        {
            let mut reporter = JsonReporter::new(&mut buf);
            reporter.emit(&RunEvent::PhaseStarted { phase: Phase::Setup });
            reporter.emit(&RunEvent::WaitFinished);
            reporter.emit(&RunEvent::AssertionEvaluated {
                description: "Bob decrypts".into(),
                passed: true,
                detail: None,
            });
        }
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "phase_started");
        assert_eq!(lines[0]["phase"], "setup");
        assert_eq!(lines[1]["event"], "assertion_evaluated");
        assert!(lines[1].get("detail").is_none());
    }

    #[test]
    fn test_finished_event_carries_verdict() {
        let mut scorer = AssertionScorer::new("kick");
        scorer.record("a", true, None);
        let event = RunEvent::ScenarioFinished {
            result: scorer.finalize(None),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["result"]["verdict"], "success");
        assert_eq!(value["result"]["passed"], 1);
    }

    #[test]
    fn test_memory_reporter_collects_assertions() {
        let mut reporter = MemoryReporter::new();
        reporter.emit(&RunEvent::Interrupted);
        reporter.emit(&RunEvent::AssertionEvaluated {
            description: "x".into(),
            passed: false,
            detail: Some("missing".into()),
        });
        assert_eq!(reporter.events().len(), 2);
        assert_eq!(reporter.assertions(), vec![("x", false)]);
    }
}
