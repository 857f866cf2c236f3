//! Action dispatch: turns a classified payload into backend input commands.
//!
//! Two backends share the [`CommandBackend`] seam. [`ExternalProcessBackend`]
//! runs an executor program once per command; [`InProcessBackend`] drives an
//! [`InputDriver`] supplied by the host. Batches abort on the first failing
//! command, and failures are reported as a [`DispatchOutcome`], never as an
//! error into the step loop.

use std::process::Command as ProcessCommand;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::classifier::ActionPayload;
use crate::core::command::{Command, MouseButton, Platform};
use crate::core::translate::translate_code;
use crate::core::types::Dimensions;
use crate::io::config::{BackendKind, DispatchConfig};
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("`{command}` timed out after {}ms", .timeout.as_millis())]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` failed: {message}")]
    Execution { command: String, message: String },
    #[error("no recognizable commands in action ({} statement(s) dropped)", .statements.len())]
    Unrecognized { statements: Vec<String> },
}

impl DispatchError {
    fn execution(command: &Command, message: impl Into<String>) -> Self {
        DispatchError::Execution {
            command: command.kind().to_string(),
            message: message.into(),
        }
    }
}

/// Executes single commands against the desktop.
pub trait CommandBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, command: &Command) -> Result<(), DispatchError>;

    fn screen_size(&self) -> Result<Dimensions, DispatchError>;
}

/// Result of dispatching one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub success: bool,
    /// Failure description, recorded on the step.
    pub diagnostic: Option<String>,
    /// Commands that completed before success or the first failure.
    pub executed: usize,
    /// Statements the textual translator could not interpret.
    pub dropped: Vec<String>,
}

pub struct ActionDispatcher {
    backend: Box<dyn CommandBackend>,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new(backend: impl CommandBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// Build the configured backend. `in_process` requires a host driver.
    pub fn from_config(cfg: &DispatchConfig, driver: Option<Arc<dyn InputDriver>>) -> Result<Self> {
        match cfg.backend {
            BackendKind::External => Ok(Self::new(ExternalProcessBackend::from_config(cfg))),
            BackendKind::InProcess => {
                let driver = driver
                    .ok_or_else(|| anyhow!("in_process backend requires an input driver"))?;
                Ok(Self::new(InProcessBackend::new(driver, cfg.platform())))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn screen_size(&self) -> Result<Dimensions, DispatchError> {
        self.backend.screen_size()
    }

    #[instrument(skip_all, fields(backend = self.backend.name()))]
    pub fn dispatch(&self, payload: &ActionPayload) -> DispatchOutcome {
        let (commands, dropped) = match payload {
            ActionPayload::Commands(commands) => (commands.clone(), Vec::new()),
            ActionPayload::Code(code) => {
                let translation = translate_code(code);
                if !translation.dropped.is_empty() {
                    warn!(
                        dropped = translation.dropped.len(),
                        statements = ?translation.dropped,
                        "skipping untranslatable statements"
                    );
                }
                (translation.commands, translation.dropped)
            }
        };

        if commands.is_empty() && !dropped.is_empty() {
            let err = DispatchError::Unrecognized {
                statements: dropped.clone(),
            };
            return DispatchOutcome {
                success: false,
                diagnostic: Some(err.to_string()),
                executed: 0,
                dropped,
            };
        }

        match self.run_batch(&commands) {
            Ok(executed) => DispatchOutcome {
                success: true,
                diagnostic: None,
                executed,
                dropped,
            },
            Err((executed, err)) => DispatchOutcome {
                success: false,
                diagnostic: Some(err.to_string()),
                executed,
                dropped,
            },
        }
    }

    fn run_batch(&self, commands: &[Command]) -> Result<usize, (usize, DispatchError)> {
        for (index, command) in commands.iter().enumerate() {
            debug!(index, kind = command.kind(), "executing command");
            if let Err(err) = self.backend.execute(command) {
                warn!(index, kind = command.kind(), err = %err, "command failed, aborting batch");
                return Err((index, err));
            }
        }
        Ok(commands.len())
    }
}

/// Runs an executor program once per command:
/// `<program...> -json <record> -platform <tag>`.
#[derive(Debug, Clone)]
pub struct ExternalProcessBackend {
    program: Vec<String>,
    platform: Platform,
    command_timeout: Duration,
    query_timeout: Duration,
    output_limit_bytes: usize,
}

impl ExternalProcessBackend {
    pub fn new(program: Vec<String>, platform: Platform) -> Self {
        let defaults = DispatchConfig::default();
        Self {
            program,
            platform,
            command_timeout: defaults.command_timeout(),
            query_timeout: defaults.query_timeout(),
            output_limit_bytes: defaults.output_limit_bytes,
        }
    }

    pub fn from_config(cfg: &DispatchConfig) -> Self {
        Self {
            program: cfg.command.clone(),
            platform: cfg.platform(),
            command_timeout: cfg.command_timeout(),
            query_timeout: cfg.query_timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    pub fn with_timeouts(mut self, command_timeout: Duration, query_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self.query_timeout = query_timeout;
        self
    }

    /// Run one command and return its stdout.
    fn run(&self, command: &Command) -> Result<String, DispatchError> {
        let Some((program, leading)) = self.program.split_first() else {
            return Err(DispatchError::execution(command, "executor command is empty"));
        };
        let record = serde_json::to_string(&command.to_record(self.platform))
            .map_err(|err| DispatchError::execution(command, format!("serialize command: {err}")))?;
        let timeout = if command.is_query() {
            self.query_timeout
        } else {
            self.command_timeout
        };

        let mut cmd = ProcessCommand::new(program);
        cmd.args(leading)
            .arg("-json")
            .arg(&record)
            .arg("-platform")
            .arg(self.platform.tag());

        let output = run_command_with_timeout(cmd, timeout, self.output_limit_bytes)
            .map_err(|err| DispatchError::execution(command, format!("{err:#}")))?;
        if output.timed_out {
            return Err(DispatchError::Timeout {
                command: command.kind().to_string(),
                timeout,
            });
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let message = if stderr.is_empty() {
                format!("executor exited with {}", output.status)
            } else {
                stderr
            };
            return Err(DispatchError::execution(command, message));
        }
        Ok(output.stdout_text())
    }
}

impl CommandBackend for ExternalProcessBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    #[instrument(skip_all, fields(kind = command.kind()))]
    fn execute(&self, command: &Command) -> Result<(), DispatchError> {
        let stdout = self.run(command)?;
        if command.is_query() {
            debug!(result = %stdout.trim(), "query result");
        }
        Ok(())
    }

    fn screen_size(&self) -> Result<Dimensions, DispatchError> {
        let command = Command::ScreenSize {};
        let stdout = self.run(&command)?;
        serde_json::from_str(stdout.trim()).map_err(|err| {
            DispatchError::execution(&command, format!("parse screen size `{}`: {err}", stdout.trim()))
        })
    }
}

/// Host-provided desktop input primitives for the in-process backend.
///
/// Key names arrive already normalized for the target platform.
pub trait InputDriver: Send + Sync {
    fn move_to(&self, x: i32, y: i32) -> Result<()>;
    fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<()>;
    fn drag(&self, from: (i32, i32), to: (i32, i32), button: MouseButton) -> Result<()>;
    fn type_text(&self, text: &str) -> Result<()>;
    fn key_tap(&self, key: &str) -> Result<()>;
    fn key_down(&self, key: &str) -> Result<()>;
    fn key_up(&self, key: &str) -> Result<()>;
    fn scroll(&self, clicks: i32, horizontal: bool) -> Result<()>;
    fn screen_size(&self) -> Result<Dimensions>;
}

pub struct InProcessBackend {
    driver: Arc<dyn InputDriver>,
    platform: Platform,
}

impl InProcessBackend {
    pub fn new(driver: Arc<dyn InputDriver>, platform: Platform) -> Self {
        Self { driver, platform }
    }

    fn keys(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|key| self.platform.normalize_key(key))
            .collect()
    }

    /// Hold `keys` down around `action`, releasing in reverse order even when
    /// the action fails.
    fn with_held_keys(&self, keys: &[String], action: impl FnOnce() -> Result<()>) -> Result<()> {
        let keys = self.keys(keys);
        let mut pressed = Vec::with_capacity(keys.len());
        let mut result = Ok(());
        for key in &keys {
            if let Err(err) = self.driver.key_down(key) {
                result = Err(err);
                break;
            }
            pressed.push(key);
        }
        if result.is_ok() {
            result = action();
        }
        for key in pressed.into_iter().rev() {
            if let Err(err) = self.driver.key_up(key) {
                warn!(key = %key, err = %err, "failed to release held key");
            }
        }
        result
    }

    fn run(&self, command: &Command) -> Result<()> {
        match command {
            Command::Click {
                x,
                y,
                clicks,
                button,
                hold_keys,
            } => {
                ensure_on_screen(*x, *y)?;
                self.with_held_keys(hold_keys, || {
                    self.driver.move_to(*x, *y)?;
                    self.driver.click(*x, *y, *button, *clicks)
                })
            }
            Command::MoveTo { x, y } => {
                ensure_on_screen(*x, *y)?;
                self.driver.move_to(*x, *y)
            }
            Command::DragTo {
                x1,
                y1,
                x2,
                y2,
                button,
                hold_keys,
            } => {
                ensure_on_screen(*x1, *y1)?;
                ensure_on_screen(*x2, *y2)?;
                self.with_held_keys(hold_keys, || self.driver.drag((*x1, *y1), (*x2, *y2), *button))
            }
            Command::Type { text } => self.driver.type_text(text),
            Command::Press { key } => self.driver.key_tap(&self.platform.normalize_key(key)),
            Command::Hotkey { keys } => {
                let Some((main, modifiers)) = keys.split_last() else {
                    return Err(anyhow!("hotkey requires at least one key"));
                };
                let main = self.platform.normalize_key(main);
                self.with_held_keys(modifiers, || self.driver.key_tap(&main))
            }
            Command::KeyDown { key } => self.driver.key_down(&self.platform.normalize_key(key)),
            Command::KeyUp { key } => self.driver.key_up(&self.platform.normalize_key(key)),
            Command::Scroll {
                x,
                y,
                clicks,
                horizontal,
            } => {
                ensure_on_screen(*x, *y)?;
                self.driver.move_to(*x, *y)?;
                self.driver.scroll(*clicks, *horizontal)
            }
            Command::Wait { duration } => {
                thread::sleep(Duration::try_from_secs_f64(*duration).unwrap_or_default());
                Ok(())
            }
            Command::ScreenSize {} => {
                let size = self.driver.screen_size()?;
                debug!(%size, "query result");
                Ok(())
            }
        }
    }
}

fn ensure_on_screen(x: i32, y: i32) -> Result<()> {
    if x < 0 || y < 0 {
        return Err(anyhow!("invalid coordinates: x={x}, y={y}"));
    }
    Ok(())
}

impl CommandBackend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    fn execute(&self, command: &Command) -> Result<(), DispatchError> {
        self.run(command)
            .map_err(|err| DispatchError::execution(command, format!("{err:#}")))
    }

    fn screen_size(&self) -> Result<Dimensions, DispatchError> {
        self.driver
            .screen_size()
            .map_err(|err| DispatchError::execution(&Command::ScreenSize {}, format!("{err:#}")))
    }
}
