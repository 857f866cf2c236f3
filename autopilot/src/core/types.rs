//! Task lifecycle types shared by the registry, the step loop and the service.
//!
//! These types carry no behavior beyond small, deterministic helpers. The
//! registry is the only owner that mutates them.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `Pending` may jump straight to `Failed`/`Cancelled` so that tasks whose
    /// initialization fails never appear as running.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running)
            | (TaskStatus::Pending, TaskStatus::Failed)
            | (TaskStatus::Pending, TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale to fit within `max_dim` on both axes, preserving aspect ratio.
    ///
    /// Never upscales. Zero-sized inputs are returned unchanged.
    pub fn scale_to_fit(self, max_dim: u32) -> Self {
        if self.width == 0 || self.height == 0 {
            return self;
        }
        let factor = (f64::from(max_dim) / f64::from(self.width))
            .min(f64::from(max_dim) / f64::from(self.height))
            .min(1.0);
        Self {
            width: (f64::from(self.width) * factor) as u32,
            height: (f64::from(self.height) * factor) as u32,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A captured environment snapshot (PNG-encoded screen image).
///
/// Bytes are reference-counted so registry snapshots stay cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct Observation {
    pub bytes: Arc<[u8]>,
    pub size: Dimensions,
}

impl Observation {
    pub fn new(bytes: impl Into<Arc<[u8]>>, size: Dimensions) -> Self {
        Self {
            bytes: bytes.into(),
            size,
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("bytes", &self.bytes.len())
            .field("size", &self.size)
            .finish()
    }
}

/// Immutable log entry for one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based, strictly increasing within a task.
    pub step_number: u32,
    pub plan: Option<String>,
    pub reflection: Option<String>,
    pub action_description: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(step_number: u32) -> Self {
        Self {
            step_number,
            plan: None,
            reflection: None,
            action_description: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(step_number: u32, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(step_number)
        }
    }
}

/// One orchestrated automation request.
///
/// `latest_observation` is kept out of the serialized form; archives store it
/// as a separate blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub current_step: u32,
    pub max_steps: u32,
    pub steps: Vec<StepRecord>,
    #[serde(skip)]
    pub latest_observation: Option<Observation>,
    pub error: Option<String>,
    /// Outcome note for non-error completions (e.g. step budget exhausted).
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, instruction: impl Into<String>, max_steps: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            instruction: instruction.into(),
            status: TaskStatus::Pending,
            current_step: 0,
            max_steps,
            steps: Vec::new(),
            latest_observation: None,
            error: None,
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// `Step N: <plan>` lines for every step that carried a plan.
    pub fn plan_history(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|step| {
                step.plan
                    .as_deref()
                    .filter(|plan| !plan.is_empty())
                    .map(|plan| format!("Step {}: {}", step.step_number, plan))
            })
            .collect()
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.id.clone(),
            instruction: self.instruction.clone(),
            status: self.status,
            progress: format!("{}/{}", self.current_step, self.max_steps),
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Compact listing entry for `list_tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub progress: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn pending_cannot_complete_without_running() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn scale_to_fit_preserves_aspect_ratio() {
        let scaled = Dimensions::new(3840, 2160).scale_to_fit(2400);
        assert_eq!(scaled, Dimensions::new(2400, 1350));
    }

    #[test]
    fn scale_to_fit_never_upscales() {
        let dims = Dimensions::new(1280, 800);
        assert_eq!(dims.scale_to_fit(2400), dims);
    }

    #[test]
    fn plan_history_skips_steps_without_plan() {
        let mut task = Task::new("t", "open calculator", 3);
        task.steps.push(StepRecord {
            plan: Some("open the dock".to_string()),
            ..StepRecord::new(1)
        });
        task.steps.push(StepRecord::failed(2, "capture failed"));
        task.steps.push(StepRecord {
            plan: Some("click calculator".to_string()),
            ..StepRecord::new(3)
        });

        assert_eq!(
            task.plan_history(),
            vec![
                "Step 1: open the dock".to_string(),
                "Step 3: click calculator".to_string()
            ]
        );
    }

    #[test]
    fn task_json_omits_observation() {
        let mut task = Task::new("t", "x", 1);
        task.latest_observation = Some(Observation::new(vec![1u8, 2, 3], Dimensions::new(1, 1)));
        let json = serde_json::to_value(&task).expect("serialize");
        assert!(json.get("latest_observation").is_none());
        assert_eq!(json["status"], "pending");
    }
}
