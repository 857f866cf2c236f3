//! Bounded observe → decide → classify → dispatch loop for one task.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::control::PauseGate;
use crate::core::classifier::{Classification, classify};
use crate::core::types::{Dimensions, Observation, StepRecord, TaskStatus};
use crate::io::capture::ObservationSource;
use crate::io::config::LoopConfig;
use crate::io::decision::{Decision, DecisionEngine};
use crate::io::dispatcher::ActionDispatcher;
use crate::io::progress::{ProgressSink, ProgressUpdate};
use crate::profiler::{Metadata, ProfileSummary, Profiler};
use crate::registry::{RegistryError, TaskRegistry};

/// Error stored on a task when the decision engine gives up.
pub const IMPOSSIBLE_MESSAGE: &str = "Agent marked task as impossible";

/// Non-fatal failure inside one iteration; recorded on the step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("observation failed: {0}")]
    Observation(String),
    #[error("decision failed: {0}")]
    Decision(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// External collaborators shared by every run.
#[derive(Clone)]
pub struct Collaborators {
    pub decision: Arc<dyn DecisionEngine>,
    pub capture: Arc<dyn ObservationSource>,
    pub dispatcher: Arc<ActionDispatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { steps: u32 },
    Failed { steps: u32, error: String },
    Cancelled { steps: u32 },
    /// Step budget exhausted; the task is completed with a message.
    MaxStepsReached { steps: u32 },
}

impl ExecutionOutcome {
    pub fn steps(&self) -> u32 {
        match self {
            ExecutionOutcome::Completed { steps }
            | ExecutionOutcome::Failed { steps, .. }
            | ExecutionOutcome::Cancelled { steps }
            | ExecutionOutcome::MaxStepsReached { steps } => *steps,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub profile: ProfileSummary,
}

/// One run of the loop.
pub struct RunRequest<'a> {
    pub task_id: &'a str,
    /// Dimensions observations are captured at.
    pub target: Dimensions,
    pub progress: Option<&'a dyn ProgressSink>,
}

enum StepFlow {
    Continue,
    Stop(ExecutionOutcome),
}

pub struct StepExecutor {
    registry: Arc<TaskRegistry>,
    collaborators: Collaborators,
    pause: Arc<PauseGate>,
    config: LoopConfig,
    profiler: Profiler,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        collaborators: Collaborators,
        pause: Arc<PauseGate>,
        config: LoopConfig,
    ) -> Self {
        Self {
            registry,
            collaborators,
            pause,
            config,
            profiler: Profiler::new(),
        }
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Drive the task until a terminal classification, cancellation, or the
    /// step budget runs out.
    ///
    /// Step-level failures are recorded on the task and never end the run.
    /// Errors are returned only when the task does not exist at start.
    #[instrument(skip_all, fields(task_id = request.task_id))]
    pub fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionReport> {
        self.profiler.reset();
        let task = self
            .registry
            .get(request.task_id)
            .ok_or_else(|| anyhow!("task `{}` not found", request.task_id))?;
        info!(
            max_steps = task.max_steps,
            target = %request.target,
            "starting task run"
        );

        let mut outcome = None;
        for step in (task.current_step + 1)..=task.max_steps {
            if let StepFlow::Stop(stop) = self.run_step(request, &task.instruction, step, task.max_steps) {
                outcome = Some(stop);
                break;
            }
        }
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => self.finish_budget(request.task_id, task.max_steps),
        };

        let profile = self.profiler.summary();
        info!(outcome = ?outcome, "task run finished");
        info!(target: "autopilot::profiler", "profile summary\n{profile}");
        Ok(ExecutionReport { outcome, profile })
    }

    fn run_step(
        &self,
        request: &RunRequest<'_>,
        instruction: &str,
        step: u32,
        max_steps: u32,
    ) -> StepFlow {
        let task_id = request.task_id;
        if self.is_cancelled(task_id) {
            return StepFlow::Stop(self.settled_outcome(task_id));
        }
        if !self.wait_if_paused(task_id) {
            return StepFlow::Stop(self.settled_outcome(task_id));
        }

        let span = self.profiler.scope("step", Some(Metadata::from([("step".to_string(), json!(step))])));
        debug!(step, max_steps, "step started");

        let observation = {
            let _span = self.profiler.scope("observation-capture", None);
            self.collaborators.capture.capture(request.target)
        };
        let observation = match observation {
            Ok(observation) => observation,
            Err(err) => {
                let err = StepError::Observation(format!("{err:#}"));
                return self.record_step_error(request, step, max_steps, &err);
            }
        };

        if !self.wait_if_paused(task_id) {
            return StepFlow::Stop(self.settled_outcome(task_id));
        }
        let decision = {
            let _span = self.profiler.scope("decision", None);
            self.collaborators.decision.predict(instruction, &observation)
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(err) => {
                let err = StepError::Decision(format!("{err:#}"));
                return self.record_step_error(request, step, max_steps, &err);
            }
        };

        let classification = {
            let _span = self.profiler.scope("classification", None);
            classify(&decision.action)
        };
        span.add_metadata(Metadata::from([(
            "classification".to_string(),
            json!(classification_name(&classification)),
        )]));
        let mut record = step_record(step, &decision);

        match classification {
            Classification::Done => {
                if let Err(stop) = self.append(request, record, Some(observation), max_steps) {
                    return StepFlow::Stop(stop);
                }
                info!(step, "task reported done");
                StepFlow::Stop(self.finish(task_id, TaskStatus::Completed, None))
            }
            Classification::Fail => {
                if let Err(stop) = self.append(request, record, Some(observation), max_steps) {
                    return StepFlow::Stop(stop);
                }
                warn!(step, "task reported impossible");
                StepFlow::Stop(self.finish(
                    task_id,
                    TaskStatus::Failed,
                    Some(IMPOSSIBLE_MESSAGE.to_string()),
                ))
            }
            Classification::Wait => {
                if let Err(stop) = self.append(request, record, Some(observation), max_steps) {
                    return StepFlow::Stop(stop);
                }
                debug!(step, "waiting before next observation");
                self.sleep_unless_cancelled(task_id, self.config.wait_interval());
                StepFlow::Continue
            }
            Classification::Next => {
                if let Err(stop) = self.append(request, record, Some(observation), max_steps) {
                    return StepFlow::Stop(stop);
                }
                StepFlow::Continue
            }
            Classification::Execute(payload) => {
                if !self.wait_if_paused(task_id) {
                    return StepFlow::Stop(self.settled_outcome(task_id));
                }
                self.sleep_unless_cancelled(task_id, self.config.settle());
                let outcome = {
                    let _span = self.profiler.scope("action-dispatch", None);
                    self.collaborators.dispatcher.dispatch(&payload)
                };
                self.sleep_unless_cancelled(task_id, self.config.settle());
                if !outcome.success {
                    let diagnostic = outcome
                        .diagnostic
                        .unwrap_or_else(|| "unknown dispatch failure".to_string());
                    warn!(step, err = %diagnostic, "dispatch failed");
                    record.error = Some(StepError::Dispatch(diagnostic).to_string());
                }
                self.wait_if_paused(task_id);
                if let Err(stop) = self.append(request, record, Some(observation), max_steps) {
                    return StepFlow::Stop(stop);
                }
                StepFlow::Continue
            }
        }
    }

    fn record_step_error(
        &self,
        request: &RunRequest<'_>,
        step: u32,
        max_steps: u32,
        err: &StepError,
    ) -> StepFlow {
        warn!(step, err = %err, "step failed");
        let record = StepRecord::failed(step, err.to_string());
        if let Err(stop) = self.append(request, record, None, max_steps) {
            return StepFlow::Stop(stop);
        }
        self.sleep_unless_cancelled(request.task_id, self.config.step_error_backoff());
        StepFlow::Continue
    }

    /// Append a step record and report progress.
    ///
    /// A rejected append means the task was finished (or removed) elsewhere;
    /// the returned outcome ends the run.
    fn append(
        &self,
        request: &RunRequest<'_>,
        record: StepRecord,
        observation: Option<Observation>,
        max_steps: u32,
    ) -> Result<(), ExecutionOutcome> {
        let step = record.step_number;
        let plan = record.plan.clone();
        match self.registry.append_step(request.task_id, record, observation) {
            Ok(()) => {}
            Err(RegistryError::Finished { status, .. }) => {
                info!(step, %status, "task finished elsewhere, dropping step");
                return Err(self.settled_outcome(request.task_id));
            }
            Err(err) if err.is_not_found() => {
                warn!(step, "task removed while running");
                return Err(ExecutionOutcome::Cancelled { steps: step - 1 });
            }
            Err(err) => {
                error!(step, err = %err, "step record rejected");
                return Err(self.finish(request.task_id, TaskStatus::Failed, Some(err.to_string())));
            }
        }

        if let Some(progress) = request.progress {
            let update = ProgressUpdate::new(request.task_id, step, max_steps, plan.as_deref());
            if let Err(err) = progress.report(&update) {
                warn!(step, err = %err, "progress report failed");
            }
        }
        Ok(())
    }

    fn finish(&self, task_id: &str, status: TaskStatus, error: Option<String>) -> ExecutionOutcome {
        if let Err(err) = self.registry.transition(task_id, status, error) {
            debug!(err = %err, "terminal transition lost the race");
        }
        self.settled_outcome(task_id)
    }

    fn finish_budget(&self, task_id: &str, max_steps: u32) -> ExecutionOutcome {
        let message = format!("reached maximum steps ({max_steps})");
        match self.registry.complete_with_message(task_id, message) {
            Ok(()) => {
                info!(max_steps, "step budget exhausted");
                ExecutionOutcome::MaxStepsReached { steps: max_steps }
            }
            Err(err) => {
                debug!(err = %err, "budget completion lost the race");
                self.settled_outcome(task_id)
            }
        }
    }

    /// Outcome matching the task's current registry state.
    fn settled_outcome(&self, task_id: &str) -> ExecutionOutcome {
        let Some(task) = self.registry.get(task_id) else {
            return ExecutionOutcome::Cancelled { steps: 0 };
        };
        let steps = task.current_step;
        match task.status {
            TaskStatus::Completed if task.message.is_some() => {
                ExecutionOutcome::MaxStepsReached { steps }
            }
            TaskStatus::Completed => ExecutionOutcome::Completed { steps },
            TaskStatus::Failed => ExecutionOutcome::Failed {
                steps,
                error: task.error.unwrap_or_default(),
            },
            _ => ExecutionOutcome::Cancelled { steps },
        }
    }

    fn is_cancelled(&self, task_id: &str) -> bool {
        self.registry
            .status(task_id)
            .is_none_or(TaskStatus::is_terminal)
    }

    /// Returns `false` when the task was cancelled while paused.
    fn wait_if_paused(&self, task_id: &str) -> bool {
        self.pause
            .wait_while_paused(self.config.pause_poll(), || self.is_cancelled(task_id))
    }

    fn sleep_unless_cancelled(&self, task_id: &str, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        let poll = self.config.pause_poll().max(Duration::from_millis(1));
        loop {
            let now = Instant::now();
            if now >= deadline || self.is_cancelled(task_id) {
                return;
            }
            thread::sleep(poll.min(deadline - now));
        }
    }
}

fn step_record(step: u32, decision: &Decision) -> StepRecord {
    StepRecord {
        plan: decision.info.plan.clone(),
        reflection: decision.info.reflection.clone(),
        action_description: Some(decision.action.describe()),
        ..StepRecord::new(step)
    }
}

fn classification_name(classification: &Classification) -> &'static str {
    match classification {
        Classification::Done => "done",
        Classification::Fail => "fail",
        Classification::Wait => "wait",
        Classification::Next => "next",
        Classification::Execute(_) => "execute",
    }
}
