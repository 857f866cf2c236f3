//! Autopilot configuration loaded from `autopilot.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::command::Platform;

/// Autopilot configuration (TOML).
///
/// Missing fields default to the values a desktop deployment runs with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Step budget for new tasks.
    pub max_steps: u32,

    /// Tasks older than this are removed by the sweeper.
    pub cleanup_age_hours: u64,

    /// Finished tasks are archived here when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,

    #[serde(rename = "loop")]
    pub step_loop: LoopConfig,
    pub observation: ObservationConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Sleep after a `wait` decision.
    pub wait_interval_ms: u64,
    /// Delay before and after dispatching commands, letting the UI settle.
    pub settle_ms: u64,
    /// Sleep after an observation or decision error.
    pub step_error_backoff_ms: u64,
    /// Upper bound on how long a paused run goes without checking for cancellation.
    pub pause_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObservationConfig {
    /// Largest edge, in pixels, of captured observations.
    pub max_dimension: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    External,
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchConfig {
    pub backend: BackendKind,
    /// External executor program and leading arguments (e.g. `["robotgo_executor"]`).
    pub command: Vec<String>,
    pub command_timeout_secs: u64,
    /// Timeout for query commands such as `screenSize`.
    pub query_timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Defaults to the platform of the running process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_steps: 15,
            cleanup_age_hours: 24,
            archive_dir: None,
            step_loop: LoopConfig::default(),
            observation: ObservationConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            wait_interval_ms: 5_000,
            settle_ms: 1_000,
            step_error_backoff_ms: 2_000,
            pause_poll_ms: 100,
        }
    }
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            max_dimension: 2400,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::External,
            command: vec!["robotgo_executor".to_string()],
            command_timeout_secs: 10,
            query_timeout_secs: 5,
            output_limit_bytes: 100_000,
            platform: None,
        }
    }
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.cleanup_age_hours == 0 {
            return Err(anyhow!("cleanup_age_hours must be > 0"));
        }
        if self.step_loop.pause_poll_ms == 0 {
            return Err(anyhow!("loop.pause_poll_ms must be > 0"));
        }
        if self.observation.max_dimension == 0 {
            return Err(anyhow!("observation.max_dimension must be > 0"));
        }
        self.dispatch.validate()
    }

    pub fn cleanup_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_age_hours.saturating_mul(3600))
    }
}

impl LoopConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn step_error_backoff(&self) -> Duration {
        Duration::from_millis(self.step_error_backoff_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    /// No sleeps at all; used by tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            wait_interval_ms: 0,
            settle_ms: 0,
            step_error_backoff_ms: 0,
            pause_poll_ms: 5,
        }
    }
}

impl DispatchConfig {
    fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("dispatch.command_timeout_secs must be > 0"));
        }
        if self.query_timeout_secs == 0 {
            return Err(anyhow!("dispatch.query_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("dispatch.output_limit_bytes must be > 0"));
        }
        if self.backend == BackendKind::External
            && (self.command.is_empty() || self.command[0].trim().is_empty())
        {
            return Err(anyhow!("dispatch.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn platform(&self) -> Platform {
        self.platform.unwrap_or_else(Platform::current)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::archive::write_atomic(path, buf.as_bytes())
}
