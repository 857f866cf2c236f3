//! Backend command vocabulary and its wire record.
//!
//! A [`Command`] is one discrete desktop-input operation. On the wire (the
//! external executor contract) it becomes a [`CommandRecord`]:
//! `{"type": "...", "params": {...}, "platform": "linux"}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target platform tag passed to backends; drives key-name normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Darwin,
    Windows,
    Linux,
}

impl Platform {
    /// Platform of the running process. Unknown unixes are treated as Linux.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::Darwin,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Platform::Darwin => "darwin",
            Platform::Windows => "windows",
            Platform::Linux => "linux",
        }
    }

    /// Map modifier aliases to the names the platform's input layer expects.
    pub fn normalize_key(self, key: &str) -> String {
        let lower = key.to_ascii_lowercase();
        let mapped = match (self, lower.as_str()) {
            (Platform::Darwin, "win" | "meta" | "command") => Some("cmd"),
            (Platform::Darwin, "opt" | "option") => Some("alt"),
            (Platform::Windows, "command" | "cmd" | "meta") => Some("win"),
            (Platform::Windows, "opt" | "option") => Some("alt"),
            (Platform::Linux, "command" | "cmd" | "win" | "meta") => Some("super"),
            (Platform::Linux, "opt" | "option") => Some("alt"),
            _ => None,
        };
        mapped.map_or_else(|| key.to_string(), str::to_string)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

fn one() -> u32 {
    1
}

/// One discrete backend command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Command {
    #[serde(rename = "click")]
    Click {
        x: i32,
        y: i32,
        #[serde(default = "one")]
        clicks: u32,
        #[serde(default)]
        button: MouseButton,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        hold_keys: Vec<String>,
    },
    #[serde(rename = "moveTo")]
    MoveTo { x: i32, y: i32 },
    #[serde(rename = "dragTo")]
    DragTo {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        #[serde(default)]
        button: MouseButton,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        hold_keys: Vec<String>,
    },
    #[serde(rename = "type")]
    Type { text: String },
    #[serde(rename = "press")]
    Press { key: String },
    #[serde(rename = "hotkey")]
    Hotkey { keys: Vec<String> },
    #[serde(rename = "keyDown")]
    KeyDown { key: String },
    #[serde(rename = "keyUp")]
    KeyUp { key: String },
    #[serde(rename = "scroll")]
    Scroll {
        x: i32,
        y: i32,
        clicks: i32,
        #[serde(default)]
        horizontal: bool,
    },
    /// Pause for `duration` seconds.
    #[serde(rename = "wait")]
    Wait { duration: f64 },
    /// Query-only: returns `{width, height}`.
    #[serde(rename = "screenSize")]
    ScreenSize {},
}

impl Command {
    /// Wire name of the command type.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Click { .. } => "click",
            Command::MoveTo { .. } => "moveTo",
            Command::DragTo { .. } => "dragTo",
            Command::Type { .. } => "type",
            Command::Press { .. } => "press",
            Command::Hotkey { .. } => "hotkey",
            Command::KeyDown { .. } => "keyDown",
            Command::KeyUp { .. } => "keyUp",
            Command::Scroll { .. } => "scroll",
            Command::Wait { .. } => "wait",
            Command::ScreenSize {} => "screenSize",
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Command::ScreenSize {})
    }

    pub fn to_record(&self, platform: Platform) -> CommandRecord {
        let params = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("params").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        CommandRecord {
            kind: self.kind().to_string(),
            params: match params {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
            platform: platform.tag().to_string(),
        }
    }
}

/// Serialized command as handed to the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: Value,
    pub platform: String,
}

/// Render a command batch as compact JSON for step records and logs.
pub fn describe_commands(commands: &[Command]) -> String {
    serde_json::to_string(commands).unwrap_or_else(|_| format!("{} commands", commands.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn click_record_matches_executor_contract() {
        let command = Command::Click {
            x: 10,
            y: 20,
            clicks: 2,
            button: MouseButton::Right,
            hold_keys: Vec::new(),
        };
        let record = serde_json::to_value(command.to_record(Platform::Linux)).expect("json");
        assert_eq!(
            record,
            json!({
                "type": "click",
                "params": {"x": 10, "y": 20, "clicks": 2, "button": "right"},
                "platform": "linux"
            })
        );
    }

    #[test]
    fn screen_size_record_has_empty_params() {
        let record = Command::ScreenSize {}.to_record(Platform::Darwin);
        assert_eq!(record.kind, "screenSize");
        assert_eq!(record.params, json!({}));
        assert_eq!(record.platform, "darwin");
    }

    #[test]
    fn click_defaults_apply_when_params_are_missing() {
        let command: Command =
            serde_json::from_value(json!({"type": "click", "params": {"x": 1, "y": 2}}))
                .expect("parse");
        assert_eq!(
            command,
            Command::Click {
                x: 1,
                y: 2,
                clicks: 1,
                button: MouseButton::Left,
                hold_keys: Vec::new(),
            }
        );
    }

    #[test]
    fn normalize_key_maps_modifier_aliases() {
        assert_eq!(Platform::Linux.normalize_key("cmd"), "super");
        assert_eq!(Platform::Windows.normalize_key("Option"), "alt");
        assert_eq!(Platform::Darwin.normalize_key("win"), "cmd");
        assert_eq!(Platform::Darwin.normalize_key("Enter"), "Enter");
    }
}
