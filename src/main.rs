//! Spaceway E2E - black-box scenario runner for the Spaceway engine
//!
//! Launches engine instances, scripts them over stdin, reads facts back out
//! of their logs and scores declarative assertions.

use clap::{ArgAction, Parser};
use spaceway_e2e::common::{config::Config, logging};
use spaceway_e2e::{cli, commands::Commands};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spaceway-e2e", about = "End-to-end scenario runner for the Spaceway engine")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More harness logging (-v debug, -vv trace); also echoes engine commands
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write harness logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let guard = logging::init_cli(cli.verbose, cli.log_file.as_deref());

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let code = match config {
        Ok(config) => match cli::dispatch(cli.command, config, cli.verbose > 0).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };

    // Flush the file layer before exiting
    drop(guard);
    std::process::exit(code);
}
