//! CLI command definitions
//!
//! Defines the clap commands for the scenario runner CLI.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::common::config::Config;

#[derive(Subcommand)]
pub enum Commands {
    /// Run one or more scenario files against the engine
    Run {
        /// Scenario YAML files, run in order
        #[arg(required = true)]
        scenarios: Vec<PathBuf>,

        /// Output format for run events
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Load and statically check scenario files without starting engines
    Validate {
        /// Scenario YAML files
        #[arg(required = true)]
        scenarios: Vec<PathBuf>,
    },

    /// List the named log fact patterns
    Patterns {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a fact pattern against a captured engine log
    Extract {
        /// Captured log file
        #[arg(long)]
        log: PathBuf,

        /// Fact name (see `patterns`)
        #[arg(long)]
        fact: String,

        /// Channel name or thread title for facts that take one
        #[arg(long)]
        arg: Option<String>,

        /// Print the number of matches instead of the first capture
        #[arg(long)]
        count: bool,
    },
}

/// How run events are rendered
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored, human-readable
    #[default]
    Console,
    /// One JSON object per line
    Json,
}

/// Command-line overrides for the config file
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    /// Engine executable (path or name on PATH)
    #[arg(long)]
    pub engine: Option<PathBuf>,

    /// Multiply every settle, warm-up and wait by this factor
    #[arg(long)]
    pub time_scale: Option<f64>,

    /// Directory holding per-scenario run directories
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// First port handed to engine instances
    #[arg(long)]
    pub base_port: Option<u16>,

    /// Warm-up seconds after spawning engines
    #[arg(long)]
    pub warmup: Option<f64>,
}

impl Overrides {
    /// Apply the overrides that were given on top of `config`
    pub fn apply(self, config: &mut Config) {
        if let Some(engine) = self.engine {
            config.engine.executable = engine;
        }
        if let Some(scale) = self.time_scale {
            config.settle.time_scale = scale;
        }
        if let Some(dir) = self.work_dir {
            config.workspace.root = dir;
        }
        if let Some(port) = self.base_port {
            config.workspace.base_port = port;
        }
        if let Some(warmup) = self.warmup {
            config.startup.warmup_secs = warmup;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_touch_given_fields() {
        let mut config = Config::default();
        Overrides {
            time_scale: Some(0.1),
            base_port: Some(19001),
            ..Default::default()
        }
        .apply(&mut config);
        assert_eq!(config.settle.time_scale, 0.1);
        assert_eq!(config.workspace.base_port, 19001);
        assert_eq!(config.startup.warmup_secs, 3.0);
        assert_eq!(config.engine.executable, PathBuf::from("spaceway"));
    }
}
