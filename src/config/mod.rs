// Configuration management for fmrelay
// Handles loading/saving settings, with sensible defaults when config is missing

use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "fmrelay";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub broadcast: BroadcastConfig,
    pub stages: StagesConfig,
    pub supervisor: SupervisorConfig,
    pub metadata: MetadataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub default_frequency: f64, // MHz, used when a station has no override
    pub control_fifo: PathBuf,
    pub nice: i32,
}

/// One external program in the fetch -> decode -> broadcast chain.
///
/// `args` may contain `{url}`, `{freq}` and `{ctl}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub fetch: StageCommand,
    pub decode: StageCommand,
    pub broadcast: StageCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub readiness_timeout_ms: u64,
    pub stall_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub switch_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub min_uptime_ms: u64, // failure count resets after surviving this long
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub poll_interval_ms: u64,
    pub icy_enabled: bool,
    pub user_agent: String,
    pub default_ps: String, // <= 8 chars
    pub default_rt: String,
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let log_dir = dirs::data_local_dir()
            .map(|dir| dir.join(APP_DIR).join("logs"))
            .unwrap_or_else(|| config_dir.join("logs"));

        Self {
            state_file: config_dir.join("stations.json"),
            log_dir,
            broadcast: BroadcastConfig::default(),
            stages: StagesConfig::default(),
            supervisor: SupervisorConfig::default(),
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            default_frequency: 100.0,
            control_fifo: PathBuf::from("/tmp/fmrelay_rds_ctl"),
            nice: -20,
        }
    }
}

impl StageCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            fetch: StageCommand::new(
                "curl",
                &["--silent", "--show-error", "--location", "--fail", "--connect-timeout", "10", "{url}"],
            ),
            decode: StageCommand::new(
                "sox",
                &["-V1", "-t", "mp3", "-", "-t", "wav", "-r", "44100", "-c", "2", "-"],
            ),
            broadcast: StageCommand::new(
                "pifmrds",
                &["-freq", "{freq}", "-ctl", "{ctl}", "-audio", "-"],
            ),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: 15_000,
            stall_timeout_ms: 10_000,
            grace_period_ms: 3_000,
            switch_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 15_000,
            min_uptime_ms: 30_000,
        }
    }
}

impl SupervisorConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    /// Delay before the retry that follows the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.backoff_initial_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            icy_enabled: true,
            user_agent: "fmrelay".to_string(),
            default_ps: "DanceUK".to_string(),
            default_rt: "Streaming".to_string(),
        }
    }
}

impl MetadataConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load from an explicit path, writing the defaults there on first run.
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
            .join(APP_DIR);

        Ok(config_dir.join("config.toml"))
    }
}
