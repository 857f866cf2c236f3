//! Best-effort translation of pyautogui-style action code into [`Command`]s.
//!
//! Compatibility shim for decision engines that still emit code text instead
//! of structured command lists. Extraction is purely textual: statements that
//! do not match a known form are dropped and reported in
//! [`Translation::dropped`] rather than failing the batch.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::command::{Command, MouseButton};

/// Result of translating one action description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Translation {
    pub commands: Vec<Command>,
    /// Statements that could not be translated, in source order.
    pub dropped: Vec<String>,
}

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:pyautogui\.(\w+)|time\.(sleep))\((.*)\)\s*$").unwrap()
});
static INT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-?\d+").unwrap());
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'([^']*)'|"([^"]*)""#).unwrap());
static CLICKS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"clicks\s*=\s*(\d+)").unwrap());
static BUTTON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"button\s*=\s*['"](\w+)['"]"#).unwrap());

/// Translate action code into commands.
///
/// Statements are separated by `;` or newlines. Blank lines, comments and
/// `import` statements are skipped silently.
pub fn translate_code(code: &str) -> Translation {
    let mut translation = Translation::default();
    for statement in code.split([';', '\n']).map(str::trim) {
        if statement.is_empty() || statement.starts_with('#') || is_import(statement) {
            continue;
        }
        match translate_statement(statement, &mut translation.commands) {
            Some(command) => translation.commands.push(command),
            None => translation.dropped.push(statement.to_string()),
        }
    }
    translation
}

fn is_import(statement: &str) -> bool {
    statement.starts_with("import ") || statement.starts_with("from ")
}

/// Translate one statement. `previous` may be consumed (a `moveTo` that
/// supplies the start point of a drag) or inspected (scroll position).
fn translate_statement(statement: &str, previous: &mut Vec<Command>) -> Option<Command> {
    let caps = CALL_RE.captures(statement)?;
    let name = caps.get(1).or_else(|| caps.get(2))?.as_str();
    let args = caps.get(3).map_or("", |m| m.as_str());

    match name {
        "click" => {
            let (x, y) = leading_coordinates(args)?;
            let clicks = CLICKS_RE
                .captures(args)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(1);
            Some(Command::Click {
                x,
                y,
                clicks,
                button: button_arg(args),
                hold_keys: Vec::new(),
            })
        }
        "doubleClick" => {
            let (x, y) = leading_coordinates(args)?;
            Some(Command::Click {
                x,
                y,
                clicks: 2,
                button: button_arg(args),
                hold_keys: Vec::new(),
            })
        }
        "moveTo" => {
            let (x, y) = leading_coordinates(args)?;
            Some(Command::MoveTo { x, y })
        }
        "dragTo" => {
            let (x2, y2) = leading_coordinates(args)?;
            let Some(Command::MoveTo { x: x1, y: y1 }) = previous.last().cloned() else {
                return None;
            };
            previous.pop();
            Some(Command::DragTo {
                x1,
                y1,
                x2,
                y2,
                button: button_arg(args),
                hold_keys: Vec::new(),
            })
        }
        "write" | "typewrite" => first_quoted(args).map(|text| Command::Type { text }),
        "press" => first_quoted(args).map(|key| Command::Press { key }),
        "keyDown" => first_quoted(args).map(|key| Command::KeyDown { key }),
        "keyUp" => first_quoted(args).map(|key| Command::KeyUp { key }),
        "hotkey" => {
            let keys = all_quoted(args);
            (!keys.is_empty()).then_some(Command::Hotkey { keys })
        }
        "vscroll" | "hscroll" | "scroll" => {
            let clicks = args.split(',').next()?.trim().parse().ok()?;
            let (x, y) = match previous.last() {
                Some(Command::MoveTo { x, y }) => (*x, *y),
                _ => (0, 0),
            };
            Some(Command::Scroll {
                x,
                y,
                clicks,
                horizontal: name == "hscroll",
            })
        }
        "sleep" => {
            let duration: f64 = args.trim().parse().ok()?;
            (duration >= 0.0).then_some(Command::Wait { duration })
        }
        _ => None,
    }
}

/// First two integers of the positional argument list.
fn leading_coordinates(args: &str) -> Option<(i32, i32)> {
    let positional: Vec<&str> = args
        .split(',')
        .map(str::trim)
        .take_while(|arg| !arg.contains('='))
        .collect();
    if positional.len() < 2 {
        return None;
    }
    let x = INT_RE.find(positional[0])?.as_str().parse().ok()?;
    let y = INT_RE.find(positional[1])?.as_str().parse().ok()?;
    Some((x, y))
}

fn button_arg(args: &str) -> MouseButton {
    match BUTTON_RE.captures(args).as_ref().map(|c| &c[1]) {
        Some("right") => MouseButton::Right,
        Some("middle") => MouseButton::Middle,
        _ => MouseButton::Left,
    }
}

fn first_quoted(args: &str) -> Option<String> {
    all_quoted(args).into_iter().next()
}

fn all_quoted(args: &str) -> Vec<String> {
    QUOTED_RE
        .captures_iter(args)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}
