//! CLI command handling
//!
//! Dispatches CLI commands and turns their outcome into an exit code.

use std::path::PathBuf;

use colored::Colorize;
use tokio::sync::watch;

use crate::commands::{Commands, OutputFormat, Overrides};
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::facts::{Fact, Snapshot};
use crate::report::{ConsoleReporter, JsonReporter, Reporter};
use crate::scoring::ScenarioResult;
use crate::testing::{Scenario, ScenarioRunner};

/// Dispatch a CLI command, returning the process exit code
pub async fn dispatch(command: Commands, config: Config, verbose: bool) -> Result<i32> {
    match command {
        Commands::Run {
            scenarios,
            format,
            overrides,
        } => run(scenarios, format, overrides, config, verbose).await,

        Commands::Validate { scenarios } => Ok(validate(&scenarios)),

        Commands::Patterns { json } => {
            patterns(json)?;
            Ok(0)
        }

        Commands::Extract {
            log,
            fact,
            arg,
            count,
        } => extract(&log, &fact, arg.as_deref(), count),
    }
}

async fn run(
    paths: Vec<PathBuf>,
    format: OutputFormat,
    overrides: Overrides,
    mut config: Config,
    verbose: bool,
) -> Result<i32> {
    overrides.apply(&mut config);
    if config.settle.time_scale <= 0.0 {
        return Err(Error::Config("time scale must be positive".to_string()));
    }

    // Load everything up front so a typo in the last file doesn't waste a run
    let scenarios = paths
        .iter()
        .map(|p| Scenario::load(p))
        .collect::<Result<Vec<_>>>()?;

    let runner = ScenarioRunner::new(config)?;
    tracing::info!(engine = %runner.engine().display(), scenarios = scenarios.len(), "Starting run");

    let mut reporter: Box<dyn Reporter> = match format {
        OutputFormat::Console => Box::new(ConsoleReporter::new(verbose)),
        OutputFormat::Json => Box::new(JsonReporter::new(std::io::stdout())),
    };

    let results = run_all(&runner, &scenarios, reporter.as_mut(), listen_for_interrupt()).await?;
    drop(reporter);

    if format == OutputFormat::Console && scenarios.len() > 1 {
        print_summary(&results, scenarios.len());
    }

    let all_ok = results.len() == scenarios.len() && results.iter().all(|r| r.verdict.is_success());
    Ok(if all_ok { 0 } else { 1 })
}

/// Run scenarios in order until one is interrupted
///
/// The flag is checked before each scenario, so an interrupt that lands
/// during a teardown still stops the rest of the run.
async fn run_all(
    runner: &ScenarioRunner,
    scenarios: &[Scenario],
    reporter: &mut dyn Reporter,
    interrupt: watch::Receiver<bool>,
) -> Result<Vec<ScenarioResult>> {
    let mut results = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        if *interrupt.borrow() {
            tracing::warn!(scenario = %scenario.name, "Not started after interrupt");
            break;
        }
        let result = runner
            .run(scenario, reporter, interrupted(interrupt.clone()))
            .await?;
        let stop = result.interrupted;
        results.push(result);
        if stop {
            break;
        }
    }
    Ok(results)
}

/// Install one Ctrl-C listener for the whole run and latch it into a flag
fn listen_for_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("Ctrl-C received, stopping");
                let _ = tx.send(true);
            }
            Err(e) => {
                tracing::warn!("Cannot listen for Ctrl-C: {e}");
                // Keep the sender alive so waiters stay pending
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });
    rx
}

/// Resolves once the flag is set, including if it already was
async fn interrupted(mut flag: watch::Receiver<bool>) {
    if flag.wait_for(|hit| *hit).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn print_summary(results: &[ScenarioResult], planned: usize) {
    println!("{}", "Summary:".cyan());
    for result in results {
        let mark = if result.verdict.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {:<24} {:>6}  {}",
            mark,
            result.scenario,
            result.score(),
            result.verdict
        );
    }
    if results.len() < planned {
        println!("  {} {} scenario(s) not run", "-".yellow(), planned - results.len());
    }
}

fn validate(paths: &[PathBuf]) -> i32 {
    let mut failed = 0;
    for path in paths {
        match Scenario::load(path) {
            Ok(scenario) => {
                let threshold = scenario
                    .threshold
                    .map(|t| format!("{}/{}", t, scenario.assertions.len()))
                    .unwrap_or_else(|| "all".to_string());
                println!(
                    "{} {} ({} participants, {} setup + {} action steps, {} assertions, pass: {})",
                    "✓".green(),
                    scenario.name,
                    scenario.participants.len(),
                    scenario.setup.len(),
                    scenario.actions.len(),
                    scenario.assertions.len(),
                    threshold
                );
            }
            Err(e) => {
                failed += 1;
                println!("{} {}: {}", "✗".red(), path.display(), e);
            }
        }
    }
    if failed > 0 {
        1
    } else {
        0
    }
}

fn patterns(json: bool) -> Result<()> {
    let rows: Vec<(Fact, String)> = Fact::ALL
        .into_iter()
        .map(|fact| {
            let arg = fact.requires_arg().then_some("<arg>");
            fact.source(arg).map(|source| (fact, source))
        })
        .collect::<Result<_>>()?;

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(fact, source)| {
                serde_json::json!({
                    "name": fact.name(),
                    "pattern": source,
                    "requires_arg": fact.requires_arg(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    for (fact, source) in rows {
        println!("{:<22} {}", fact.name().cyan(), source);
    }
    Ok(())
}

fn extract(log: &std::path::Path, fact: &str, arg: Option<&str>, count: bool) -> Result<i32> {
    let raw = std::fs::read(log).map_err(|e| Error::FileRead {
        path: log.display().to_string(),
        error: e.to_string(),
    })?;
    let snapshot = Snapshot::new(&String::from_utf8_lossy(&raw));
    let pattern = Fact::from_name(fact)?.pattern(arg)?;

    if count {
        println!("{}", pattern.count(&snapshot));
        return Ok(0);
    }
    match pattern.extract_one(&snapshot) {
        Some(value) => {
            println!("{value}");
            Ok(0)
        }
        None => {
            eprintln!("No match for {}", pattern.name());
            Ok(1)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::report::MemoryReporter;
    use std::time::Duration;

    const ONE_CLIENT: &str = r#"
name: lone
participants: [{ name: alice }]
assertions:
  - { name: Said hello, check: contains, who: alice, text: hello }
"#;

    #[tokio::test]
    async fn test_interrupt_before_start_skips_remaining_scenarios() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.engine.executable = "true".into();
        config.workspace.root = tmp.path().to_path_buf();
        let runner = ScenarioRunner::new(config).unwrap();
        let scenarios = vec![Scenario::from_yaml(ONE_CLIENT).unwrap()];

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let mut reporter = MemoryReporter::new();
        let results = run_all(&runner, &scenarios, &mut reporter, rx).await.unwrap();

        assert!(results.is_empty());
        assert!(reporter.events().is_empty());
    }

    #[tokio::test]
    async fn test_interrupt_flag_is_latched() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        // Signalled before anyone waited; a fresh waiter still sees it
        tokio::time::timeout(Duration::from_secs(1), interrupted(rx.clone()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), interrupted(rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interrupt_waits_while_flag_is_clear() {
        let (_tx, rx) = watch::channel(false);
        let waited = tokio::time::timeout(Duration::from_millis(100), interrupted(rx)).await;
        assert!(waited.is_err());
    }
}
