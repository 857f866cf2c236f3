//! Classification of decision output into loop control or dispatchable work.
//!
//! Structured decisions ([`ActionDescription::Structured`]) map one-to-one.
//! Free text is scanned for control markers case-insensitively in priority
//! order `done`, `fail`, `wait`, `next`. Unmarked text is dispatched: as
//! commands when it is a schema-valid JSON batch, otherwise as code.

use jsonschema::Draft;
use serde_json::{Map, Value};
use tracing::debug;

use crate::core::command::{Command, describe_commands};

const COMMAND_BATCH_SCHEMA: &str = include_str!("../../schemas/command_batch.schema.json");

/// Marker vocabulary in priority order; first match wins.
const MARKERS: [(&str, Marker); 4] = [
    ("done", Marker::Done),
    ("fail", Marker::Fail),
    ("wait", Marker::Wait),
    ("next", Marker::Next),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Done,
    Fail,
    Wait,
    Next,
}

/// Tagged next action produced directly by a decision engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPlan {
    Done,
    Fail,
    Wait,
    Next,
    Execute(Vec<Command>),
}

/// What the decision engine said to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDescription {
    Structured(ActionPlan),
    /// Free-form text: a JSON command batch, a control marker, or action code.
    Text(String),
}

impl ActionDescription {
    pub fn text(text: impl Into<String>) -> Self {
        ActionDescription::Text(text.into())
    }

    /// Human-readable rendering stored on step records.
    pub fn describe(&self) -> String {
        match self {
            ActionDescription::Text(text) => text.clone(),
            ActionDescription::Structured(ActionPlan::Done) => "DONE".to_string(),
            ActionDescription::Structured(ActionPlan::Fail) => "FAIL".to_string(),
            ActionDescription::Structured(ActionPlan::Wait) => "WAIT".to_string(),
            ActionDescription::Structured(ActionPlan::Next) => "NEXT".to_string(),
            ActionDescription::Structured(ActionPlan::Execute(commands)) => {
                describe_commands(commands)
            }
        }
    }
}

/// Work the dispatcher is asked to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Commands(Vec<Command>),
    /// Action code for the textual translator.
    Code(String),
}

/// Loop-level meaning of one decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Done,
    Fail,
    Wait,
    Next,
    Execute(ActionPayload),
}

pub fn classify(action: &ActionDescription) -> Classification {
    match action {
        ActionDescription::Structured(plan) => match plan {
            ActionPlan::Done => Classification::Done,
            ActionPlan::Fail => Classification::Fail,
            ActionPlan::Wait => Classification::Wait,
            ActionPlan::Next => Classification::Next,
            ActionPlan::Execute(commands) => {
                Classification::Execute(ActionPayload::Commands(commands.clone()))
            }
        },
        ActionDescription::Text(text) => classify_text(text),
    }
}

/// Classify free text. Markers apply to the whole text, JSON included.
pub fn classify_text(text: &str) -> Classification {
    let lowered = text.to_lowercase();
    let marker = MARKERS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, marker)| *marker);
    match marker {
        Some(Marker::Done) => Classification::Done,
        Some(Marker::Fail) => Classification::Fail,
        Some(Marker::Wait) => Classification::Wait,
        Some(Marker::Next) => Classification::Next,
        None => match parse_command_batch(text) {
            Some(commands) => Classification::Execute(ActionPayload::Commands(commands)),
            None => Classification::Execute(ActionPayload::Code(text.to_string())),
        },
    }
}

/// Parse text as a schema-valid JSON command (or list of commands).
///
/// Returns `None` for anything that is not JSON or does not conform, so the
/// caller can fall back to the textual translator.
pub fn parse_command_batch(text: &str) -> Option<Vec<Command>> {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    if let Err(errors) = validate_batch(&value) {
        debug!(errors = %errors.join("; "), "json action failed command schema");
        return None;
    }
    let items = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .map(|item| serde_json::from_value(normalize_record(item)).ok())
        .collect()
}

fn validate_batch(value: &Value) -> Result<(), Vec<String>> {
    let schema: Value = serde_json::from_str(COMMAND_BATCH_SCHEMA)
        .map_err(|err| vec![format!("parse command schema: {err}")])?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|err| vec![format!("compile command schema: {err}")])?;
    let messages: Vec<String> = compiled
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(messages)
    }
}

/// Reduce a wire record to `{type, params}`, defaulting absent params.
fn normalize_record(item: Value) -> Value {
    let Value::Object(mut map) = item else {
        return item;
    };
    let mut record = Map::new();
    if let Some(kind) = map.remove("type") {
        record.insert("type".to_string(), kind);
    }
    record.insert(
        "params".to_string(),
        map.remove("params")
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    Value::Object(record)
}
