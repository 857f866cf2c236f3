//! Scripted collaborators for exercising the step loop and task service.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::command::MouseButton;
use crate::core::types::{Dimensions, Observation, TaskStatus};
use crate::io::capture::ObservationSource;
use crate::io::decision::{Decision, DecisionEngine};
use crate::io::dispatcher::InputDriver;
use crate::registry::TaskRegistry;

/// PNG signature; enough for code that only checks the observation is an image.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

type Hook = Box<dyn Fn(u32) + Send + Sync>;

/// Decision engine that replays a queue of results, then an optional
/// fallback decision forever.
#[derive(Default)]
pub struct ScriptedDecision {
    script: Mutex<VecDeque<Result<Decision, String>>>,
    fallback: Option<Decision>,
    hook: Option<Hook>,
    validation_error: Option<String>,
    calls: AtomicU32,
    instructions: Mutex<Vec<String>>,
}

impl ScriptedDecision {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self::from_results(decisions.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<Decision, String>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        }
    }

    /// Return `decision` on every call.
    pub fn always(decision: Decision) -> Self {
        Self {
            fallback: Some(decision),
            ..Self::default()
        }
    }

    /// Run `hook(call_number)` (1-based) at the start of every `predict`.
    pub fn with_hook(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn failing_validation(mut self, message: impl Into<String>) -> Self {
        self.validation_error = Some(message.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

impl DecisionEngine for ScriptedDecision {
    fn predict(&self, instruction: &str, _observation: &Observation) -> Result<Decision> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut seen) = self.instructions.lock() {
            seen.push(instruction.to_string());
        }
        if let Some(hook) = &self.hook {
            hook(call);
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        match next {
            Some(Ok(decision)) => Ok(decision),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("decision script exhausted after {} calls", call - 1)),
        }
    }

    fn validate(&self, _observation: &Observation) -> Result<()> {
        match &self.validation_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Returns a fixed PNG-signature observation at the requested size.
#[derive(Debug, Default)]
pub struct StaticCapture {
    captures: AtomicU32,
}

impl StaticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captures(&self) -> u32 {
        self.captures.load(Ordering::SeqCst)
    }
}

impl ObservationSource for StaticCapture {
    fn capture(&self, target: Dimensions) -> Result<Observation> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(Observation::new(PNG_SIGNATURE.to_vec(), target))
    }
}

/// Always fails to capture.
#[derive(Debug)]
pub struct FailingCapture {
    message: String,
}

impl FailingCapture {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl ObservationSource for FailingCapture {
    fn capture(&self, _target: Dimensions) -> Result<Observation> {
        Err(anyhow!(self.message.clone()))
    }
}

/// In-process input driver that records every call as a short string,
/// e.g. `"click 10,20 left x1"`.
#[derive(Debug)]
pub struct RecordingDriver {
    calls: Mutex<Vec<String>>,
    screen: Option<Dimensions>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            screen: Some(Dimensions::new(1920, 1080)),
        }
    }
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_screen(screen: Dimensions) -> Self {
        Self {
            screen: Some(screen),
            ..Self::default()
        }
    }

    /// Driver whose screen size query fails.
    pub fn without_screen() -> Self {
        Self {
            screen: None,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("call log poisoned"))?
            .push(call);
        Ok(())
    }
}

fn button_name(button: MouseButton) -> &'static str {
    match button {
        MouseButton::Left => "left",
        MouseButton::Right => "right",
        MouseButton::Middle => "middle",
    }
}

impl InputDriver for RecordingDriver {
    fn move_to(&self, x: i32, y: i32) -> Result<()> {
        self.record(format!("move {x},{y}"))
    }

    fn click(&self, x: i32, y: i32, button: MouseButton, clicks: u32) -> Result<()> {
        self.record(format!("click {x},{y} {} x{clicks}", button_name(button)))
    }

    fn drag(&self, from: (i32, i32), to: (i32, i32), button: MouseButton) -> Result<()> {
        self.record(format!(
            "drag {},{} -> {},{} {}",
            from.0,
            from.1,
            to.0,
            to.1,
            button_name(button)
        ))
    }

    fn type_text(&self, text: &str) -> Result<()> {
        self.record(format!("type {text}"))
    }

    fn key_tap(&self, key: &str) -> Result<()> {
        self.record(format!("tap {key}"))
    }

    fn key_down(&self, key: &str) -> Result<()> {
        self.record(format!("down {key}"))
    }

    fn key_up(&self, key: &str) -> Result<()> {
        self.record(format!("up {key}"))
    }

    fn scroll(&self, clicks: i32, horizontal: bool) -> Result<()> {
        let axis = if horizontal { "h" } else { "v" };
        self.record(format!("scroll {axis} {clicks}"))
    }

    fn screen_size(&self) -> Result<Dimensions> {
        self.screen.ok_or_else(|| anyhow!("no display attached"))
    }
}

/// Poll until the task reaches a status accepted by `done`, or `timeout`.
pub fn wait_for_status(
    registry: &TaskRegistry,
    task_id: &str,
    timeout: Duration,
    done: impl Fn(TaskStatus) -> bool,
) -> Option<TaskStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        let status = registry.status(task_id);
        if let Some(status) = status
            && done(status)
        {
            return Some(status);
        }
        if Instant::now() >= deadline {
            return status;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Poll until the task has at least `steps` recorded steps, or `timeout`.
pub fn wait_for_steps(registry: &TaskRegistry, task_id: &str, steps: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if registry
            .get(task_id)
            .is_some_and(|task| task.current_step >= steps)
        {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
