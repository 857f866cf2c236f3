//! Concurrency-safe store of task lifecycle state.
//!
//! Every operation takes one registry-wide lock for a short, I/O-free critical
//! section. Expected races (unknown ids, late transitions) come back as
//! [`RegistryError`] values; callers treat `NotFound` idempotently.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::types::{Observation, StepRecord, Task, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("task `{id}` already exists")]
    DuplicateTask { id: String },
    #[error("task `{id}` needs max_steps > 0")]
    ZeroStepBudget { id: String },
    #[error("task `{id}` not found")]
    NotFound { id: String },
    #[error("task `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task `{id}` already finished ({status})")]
    Finished { id: String, status: TaskStatus },
    #[error("task `{id}` expected step {expected}, got {got}")]
    StepOutOfOrder { id: String, expected: u32, got: u32 },
    #[error("task `{id}` step {got} exceeds max_steps {max_steps}")]
    StepBudgetExceeded { id: String, got: u32, max_steps: u32 },
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Pending` task.
    pub fn create(
        &self,
        id: &str,
        instruction: &str,
        max_steps: u32,
    ) -> Result<Task, RegistryError> {
        let mut tasks = self.lock();
        if tasks.contains_key(id) {
            return Err(RegistryError::DuplicateTask { id: id.to_string() });
        }
        if max_steps == 0 {
            return Err(RegistryError::ZeroStepBudget { id: id.to_string() });
        }
        let task = Task::new(id, instruction, max_steps);
        tasks.insert(id.to_string(), task.clone());
        debug!(task_id = id, max_steps = task.max_steps, "task created");
        Ok(task)
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    /// Current status without cloning the step history.
    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.lock().get(id).map(|task| task.status)
    }

    /// Append the next step record.
    ///
    /// `record.step_number` must be `current_step + 1` and within `max_steps`.
    /// A supplied observation replaces the previous one. The first append moves
    /// a `Pending` task to `Running`.
    pub fn append_step(
        &self,
        id: &str,
        record: StepRecord,
        observation: Option<Observation>,
    ) -> Result<(), RegistryError> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        if task.status.is_terminal() {
            return Err(RegistryError::Finished {
                id: id.to_string(),
                status: task.status,
            });
        }
        let expected = task.current_step + 1;
        if record.step_number != expected {
            return Err(RegistryError::StepOutOfOrder {
                id: id.to_string(),
                expected,
                got: record.step_number,
            });
        }
        if record.step_number > task.max_steps {
            return Err(RegistryError::StepBudgetExceeded {
                id: id.to_string(),
                got: record.step_number,
                max_steps: task.max_steps,
            });
        }

        task.current_step = record.step_number;
        task.steps.push(record);
        if observation.is_some() {
            task.latest_observation = observation;
        }
        if task.status == TaskStatus::Pending {
            task.status = TaskStatus::Running;
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    /// Move a task to `status`, recording `error` when given.
    pub fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), RegistryError> {
        self.apply_transition(id, status, error, None)
    }

    /// Complete a running task with an outcome note that is not an error.
    pub fn complete_with_message(&self, id: &str, message: String) -> Result<(), RegistryError> {
        self.apply_transition(id, TaskStatus::Completed, None, Some(message))
    }

    fn apply_transition(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<String>,
        message: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut tasks = self.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        if !task.status.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                id: id.to_string(),
                from: task.status,
                to: status,
            });
        }

        let now = Utc::now();
        let from = task.status;
        task.status = status;
        task.updated_at = now;
        if error.is_some() {
            task.error = error;
        }
        if message.is_some() {
            task.message = message;
        }
        if status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        info!(task_id = id, %from, to = %status, "task status changed");
        Ok(())
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn list_running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .map(|task| task.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, id: &str) -> Result<Task, RegistryError> {
        self.lock()
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Remove tasks created more than `max_age` ago, whatever their status.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.sweep_created_before(cutoff)
    }

    pub fn sweep_created_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, task| task.created_at >= cutoff);
        let removed = before - tasks.len();
        if removed > 0 {
            info!(removed, %cutoff, "swept old tasks");
        }
        removed
    }

    /// A panicking holder cannot leave a task half-updated (every mutation is
    /// field assignments after validation), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Dimensions;
    use std::sync::Arc;
    use std::thread;

    fn observation(byte: u8) -> Observation {
        Observation::new(vec![byte; 4], Dimensions::new(2, 2))
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let registry = TaskRegistry::new();
        let task = registry.create("a", "open calculator", 3).expect("create");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.current_step, 0);

        let err = registry.create("a", "again", 3).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTask { id: "a".to_string() });
    }

    #[test]
    fn create_rejects_zero_step_budget() {
        let registry = TaskRegistry::new();
        let err = registry.create("a", "x", 0).unwrap_err();
        assert_eq!(err, RegistryError::ZeroStepBudget { id: "a".to_string() });
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn get_unknown_task_is_none() {
        let registry = TaskRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.status("missing").is_none());
    }

    #[test]
    fn first_append_starts_task_and_replaces_observation() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 3).expect("create");

        registry
            .append_step("a", StepRecord::new(1), Some(observation(1)))
            .expect("append 1");
        registry
            .append_step("a", StepRecord::new(2), Some(observation(2)))
            .expect("append 2");
        registry
            .append_step("a", StepRecord::new(3), None)
            .expect("append 3");

        let task = registry.get("a").expect("task");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.current_step, 3);
        assert_eq!(task.steps.len(), 3);
        let latest = task.latest_observation.expect("observation");
        assert_eq!(&*latest.bytes, &[2, 2, 2, 2]);
    }

    #[test]
    fn append_enforces_step_order_and_budget() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 1).expect("create");

        let err = registry
            .append_step("a", StepRecord::new(2), None)
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::StepOutOfOrder {
                expected: 1,
                got: 2,
                ..
            }
        ));

        registry
            .append_step("a", StepRecord::new(1), None)
            .expect("append");
        let err = registry
            .append_step("a", StepRecord::new(2), None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::StepBudgetExceeded { .. }));
    }

    #[test]
    fn append_to_unknown_task_is_not_found() {
        let registry = TaskRegistry::new();
        let err = registry
            .append_step("ghost", StepRecord::new(1), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn terminal_state_is_absorbing() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 5).expect("create");
        registry
            .append_step("a", StepRecord::new(1), None)
            .expect("append");
        registry
            .transition("a", TaskStatus::Cancelled, None)
            .expect("cancel");
        let completed_at = registry.get("a").and_then(|t| t.completed_at);
        assert!(completed_at.is_some());

        let err = registry
            .transition("a", TaskStatus::Completed, None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let err = registry
            .append_step("a", StepRecord::new(2), None)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Finished {
                id: "a".to_string(),
                status: TaskStatus::Cancelled
            }
        );

        let task = registry.get("a").expect("task");
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.completed_at, completed_at);
    }

    #[test]
    fn pending_task_can_fail_directly() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 5).expect("create");
        registry
            .transition("a", TaskStatus::Failed, Some("backend unreachable".to_string()))
            .expect("fail");
        let task = registry.get("a").expect("task");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("backend unreachable"));
    }

    #[test]
    fn complete_with_message_is_not_an_error() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 1).expect("create");
        registry
            .transition("a", TaskStatus::Running, None)
            .expect("start");
        registry
            .complete_with_message("a", "reached maximum steps (1)".to_string())
            .expect("complete");
        let task = registry.get("a").expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error.is_none());
        assert_eq!(task.message.as_deref(), Some("reached maximum steps (1)"));
    }

    #[test]
    fn list_running_ids_only_reports_running_tasks() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 3).expect("create a");
        registry.create("b", "y", 3).expect("create b");
        registry
            .append_step("b", StepRecord::new(1), None)
            .expect("append");

        assert_eq!(registry.list_running_ids(), vec!["b".to_string()]);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn sweep_removes_tasks_by_age_regardless_of_status() {
        let registry = TaskRegistry::new();
        registry.create("a", "x", 3).expect("create a");
        registry.create("b", "y", 3).expect("create b");
        registry
            .append_step("b", StepRecord::new(1), None)
            .expect("append");

        assert_eq!(registry.sweep(Duration::from_secs(3600)), 0);
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(registry.sweep_created_before(cutoff), 2);
        assert!(registry.list().is_empty());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn concurrent_appends_keep_steps_and_counter_in_sync() {
        let registry = Arc::new(TaskRegistry::new());
        registry.create("a", "x", 200).expect("create");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut appended = 0;
                    while appended < 50 {
                        let next = registry.get("a").map_or(1, |t| t.current_step + 1);
                        if registry
                            .append_step("a", StepRecord::new(next), None)
                            .is_ok()
                        {
                            appended += 1;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        let task = registry.get("a").expect("task");
        assert_eq!(task.steps.len() as u32, task.current_step);
        assert_eq!(task.current_step, 200);
        assert!(
            task.steps
                .windows(2)
                .all(|pair| pair[0].step_number < pair[1].step_number)
        );
    }
}
