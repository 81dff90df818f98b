//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Engine executable settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Startup settings
    #[serde(default)]
    pub startup: StartupConfig,

    /// Settle times per operation class
    #[serde(default)]
    pub settle: SettleConfig,

    /// Teardown settings
    #[serde(default)]
    pub teardown: TeardownConfig,

    /// Per-run workspace settings
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

/// Configuration for the engine under test
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Path or name of the engine executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Additional arguments appended after `--account` and `--port`
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            extra_args: Vec::new(),
        }
    }
}

fn default_executable() -> PathBuf {
    PathBuf::from("spaceway")
}

/// Startup settings
#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    /// Warm-up interval after spawning before a client counts as running
    #[serde(default = "default_warmup")]
    pub warmup_secs: f64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            warmup_secs: default_warmup(),
        }
    }
}

fn default_warmup() -> f64 {
    3.0
}

/// Settle durations in seconds, keyed by operation class
#[derive(Debug, Deserialize, Clone)]
pub struct SettleConfig {
    /// Local state queries and simple CLI operations
    #[serde(default = "default_query")]
    pub query_secs: f64,

    /// Connect, join and key material publication
    #[serde(default = "default_network")]
    pub network_secs: f64,

    /// Membership mutations (add / kick)
    #[serde(default = "default_membership")]
    pub membership_secs: f64,

    /// Extra wait after a membership mutation for welcome/commit delivery
    #[serde(default = "default_membership_followup")]
    pub membership_followup_secs: f64,

    /// Propagation wait for two participants
    #[serde(default = "default_propagation_base")]
    pub propagation_base_secs: f64,

    /// Added propagation wait for every participant beyond the second
    #[serde(default = "default_propagation_per_participant")]
    pub propagation_per_participant_secs: f64,

    /// Upper bound for any derived propagation wait
    #[serde(default = "default_propagation_max")]
    pub propagation_max_secs: f64,

    /// Multiplier applied to every wait, including warm-up
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            query_secs: default_query(),
            network_secs: default_network(),
            membership_secs: default_membership(),
            membership_followup_secs: default_membership_followup(),
            propagation_base_secs: default_propagation_base(),
            propagation_per_participant_secs: default_propagation_per_participant(),
            propagation_max_secs: default_propagation_max(),
            time_scale: default_time_scale(),
        }
    }
}

fn default_query() -> f64 {
    2.0
}
fn default_network() -> f64 {
    4.0
}
fn default_membership() -> f64 {
    5.0
}
fn default_membership_followup() -> f64 {
    4.0
}
fn default_propagation_base() -> f64 {
    5.0
}
fn default_propagation_per_participant() -> f64 {
    2.5
}
fn default_propagation_max() -> f64 {
    15.0
}
fn default_time_scale() -> f64 {
    1.0
}

/// Teardown settings
#[derive(Debug, Deserialize, Clone)]
pub struct TeardownConfig {
    /// How long to wait for graceful exit before force-killing
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace(),
        }
    }
}

fn default_grace() -> u64 {
    3
}

/// Workspace configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Directory under which every scenario gets its own run directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// First port handed out to engine instances
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            base_port: default_base_port(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("test-runs")
}
fn default_base_port() -> u16 {
    9001
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }

    /// Resolve the engine executable
    ///
    /// Paths with a directory component are used as-is; bare names are looked up on PATH
    pub fn engine_path(&self) -> Result<PathBuf> {
        let exe = &self.engine.executable;
        if exe.components().count() > 1 || exe.is_absolute() {
            if exe.exists() {
                return Ok(exe.clone());
            }
            return Err(super::Error::EngineNotFound(exe.display().to_string()));
        }
        which::which(exe).map_err(|_| super::Error::EngineNotFound(exe.display().to_string()))
    }

    /// Warm-up interval with the time scale applied
    pub fn warmup(&self) -> Duration {
        Duration::from_secs_f64((self.startup.warmup_secs * self.settle.time_scale).max(0.0))
    }

    /// Teardown grace period
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.teardown.grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_operation_classes() {
        let config = Config::default();
        assert_eq!(config.settle.query_secs, 2.0);
        assert_eq!(config.settle.membership_followup_secs, 4.0);
        assert_eq!(config.workspace.base_port, 9001);
        assert_eq!(config.warmup(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[engine]
executable = "./target/debug/spaceway"

[settle]
time_scale = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.engine.executable, PathBuf::from("./target/debug/spaceway"));
        assert_eq!(config.settle.network_secs, 4.0);
        assert_eq!(config.warmup(), Duration::from_secs_f64(1.5));
        assert_eq!(config.teardown.grace_secs, 3);
    }

    #[test]
    fn test_missing_engine_path_is_reported() {
        let mut config = Config::default();
        config.engine.executable = PathBuf::from("./definitely/not/here");
        assert!(matches!(
            config.engine_path(),
            Err(super::super::Error::EngineNotFound(_))
        ));
    }
}
