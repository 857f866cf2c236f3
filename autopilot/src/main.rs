//! Desktop-automation autopilot CLI.
//!
//! Exercises the dispatch side of the autopilot against the configured
//! executor backend: translating action code, dispatching single actions and
//! querying the screen size.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use autopilot::core::classifier::{Classification, classify_text};
use autopilot::core::translate::translate_code;
use autopilot::exit_codes;
use autopilot::io::config::{AutopilotConfig, BackendKind, load_config};
use autopilot::io::dispatcher::ActionDispatcher;
use autopilot::logging;

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Desktop-automation task orchestration"
)]
struct Cli {
    /// Path to the TOML config; defaults apply when the file is missing.
    #[arg(long, global = true, default_value = "autopilot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the command records extracted from pyautogui-style action code.
    Translate {
        /// Action code, e.g. "pyautogui.click(10, 20)".
        code: String,
    },
    /// Classify an action description and dispatch it through the configured backend.
    Dispatch {
        /// JSON command batch, control marker, or action code.
        action: String,
    },
    /// Query the backend for the screen size.
    ScreenSize,
    /// Print the effective configuration.
    Config,
}

#[derive(Serialize)]
struct DispatchReport<'a> {
    classification: &'a str,
    success: bool,
    executed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostic: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dropped: Vec<String>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let cfg = load_config(&cli.config)?;
    match &cli.command {
        Command::Translate { code } => cmd_translate(&cfg, code),
        Command::Dispatch { action } => cmd_dispatch(&cfg, action),
        Command::ScreenSize => cmd_screen_size(&cfg),
        Command::Config => cmd_config(&cfg, &cli.config),
    }
}

fn cmd_translate(cfg: &AutopilotConfig, code: &str) -> Result<i32> {
    let translation = translate_code(code);
    let platform = cfg.dispatch.platform();
    for command in &translation.commands {
        let record = serde_json::to_string(&command.to_record(platform))
            .context("serialize command record")?;
        println!("{record}");
    }
    for statement in &translation.dropped {
        eprintln!("dropped: {statement}");
    }
    if translation.commands.is_empty() && !translation.dropped.is_empty() {
        return Ok(exit_codes::INVALID);
    }
    Ok(exit_codes::OK)
}

fn cmd_dispatch(cfg: &AutopilotConfig, action: &str) -> Result<i32> {
    let payload = match classify_text(action) {
        Classification::Execute(payload) => payload,
        control => {
            let report = DispatchReport {
                classification: control_name(&control),
                success: true,
                executed: 0,
                diagnostic: None,
                dropped: Vec::new(),
            };
            println!("{}", serde_json::to_string(&report).context("serialize report")?);
            return Ok(exit_codes::OK);
        }
    };

    let dispatcher = external_dispatcher(cfg)?;
    let outcome = dispatcher.dispatch(&payload);
    let report = DispatchReport {
        classification: "execute",
        success: outcome.success,
        executed: outcome.executed,
        diagnostic: outcome.diagnostic,
        dropped: outcome.dropped,
    };
    println!("{}", serde_json::to_string(&report).context("serialize report")?);
    Ok(if report.success {
        exit_codes::OK
    } else {
        exit_codes::DISPATCH_FAILED
    })
}

fn cmd_screen_size(cfg: &AutopilotConfig) -> Result<i32> {
    let dispatcher = external_dispatcher(cfg)?;
    match dispatcher.screen_size() {
        Ok(size) => {
            println!("{}", serde_json::to_string(&size).context("serialize size")?);
            Ok(exit_codes::OK)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(exit_codes::DISPATCH_FAILED)
        }
    }
}

fn cmd_config(cfg: &AutopilotConfig, path: &Path) -> Result<i32> {
    if !path.exists() {
        eprintln!("{} not found, showing defaults", path.display());
    }
    let rendered = toml::to_string_pretty(cfg).context("serialize config toml")?;
    print!("{rendered}");
    Ok(exit_codes::OK)
}

/// The CLI has no host input driver, so only the external backend is usable.
fn external_dispatcher(cfg: &AutopilotConfig) -> Result<ActionDispatcher> {
    if cfg.dispatch.backend != BackendKind::External {
        bail!("the CLI requires dispatch.backend = \"external\"");
    }
    ActionDispatcher::from_config(&cfg.dispatch, None)
}

fn control_name(classification: &Classification) -> &'static str {
    match classification {
        Classification::Done => "done",
        Classification::Fail => "fail",
        Classification::Wait => "wait",
        Classification::Next => "next",
        Classification::Execute(_) => "execute",
    }
}
