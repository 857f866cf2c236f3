//! Task service: admission, initialization and background execution.
//!
//! At most one task executes at a time. The active run lives in a mutex-held
//! slot; creation consults the registry first, then the slot, and rejects the
//! request with the id of the task already running. The slot is reserved
//! before initialization and the lock released while the backend is queried.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::control::PauseGate;
use crate::core::types::{Dimensions, Observation, Task, TaskStatus, TaskSummary};
use crate::io::archive;
use crate::io::config::AutopilotConfig;
use crate::io::progress::ProgressSink;
use crate::profiler::ProfileSummary;
use crate::registry::{RegistryError, TaskRegistry};
use crate::step::{Collaborators, ExecutionOutcome, RunRequest, StepExecutor};

/// Screen size assumed when the backend cannot report one.
pub const FALLBACK_SCREEN: Dimensions = Dimensions::new(1920, 1080);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("another task is already running: {running_task_id}")]
    TaskAlreadyRunning { running_task_id: String },
    #[error("task `{task_id}` failed to initialize: {message}")]
    Initialization { task_id: String, message: String },
    #[error("task `{task_id}` not found")]
    NotFound { task_id: String },
    #[error("task `{task_id}` is not running (status: {status})")]
    NotRunning { task_id: String, status: TaskStatus },
    #[error("spawn task thread: {0}")]
    Spawn(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedTask {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub task_id: String,
    pub instruction: String,
    pub status: TaskStatus,
    pub current_step: u32,
    pub max_steps: u32,
    pub plan_history: Vec<String>,
    /// Base64-encoded PNG.
    pub latest_observation: Option<String>,
    pub error: Option<String>,
    pub message: Option<String>,
}

impl From<&Task> for StatusReport {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            instruction: task.instruction.clone(),
            status: task.status,
            current_step: task.current_step,
            max_steps: task.max_steps,
            plan_history: task.plan_history(),
            latest_observation: task.latest_observation.as_ref().map(Observation::to_base64),
            error: task.error.clone(),
            message: task.message.clone(),
        }
    }
}

struct ActiveRun {
    task_id: String,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

struct Shared {
    registry: Arc<TaskRegistry>,
    collaborators: Collaborators,
    pause: Arc<PauseGate>,
    config: AutopilotConfig,
    active: Mutex<Option<ActiveRun>>,
    run_finished: Condvar,
}

impl Shared {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `task_id`'s run finished and wake `join_active` waiters.
    fn release(&self, task_id: &str) {
        let mut active = self.lock_active();
        if let Some(run) = active.as_mut()
            && run.task_id == task_id
        {
            run.finished = true;
        }
        drop(active);
        self.run_finished.notify_all();
    }

    /// Attach the spawned thread to its reserved slot. If the run already
    /// finished and the slot was taken over, the thread is joined here.
    fn attach(&self, task_id: &str, handle: JoinHandle<()>) {
        let mut active = self.lock_active();
        match active.as_mut() {
            Some(run) if run.task_id == task_id => run.handle = Some(handle),
            _ => {
                drop(active);
                if handle.join().is_err() {
                    warn!(task_id, "task thread panicked");
                }
            }
        }
    }

    /// Check the backend and decision engine; returns the capture target.
    fn initialize(&self) -> Result<Dimensions> {
        let screen = match self.collaborators.dispatcher.screen_size() {
            Ok(screen) => screen,
            Err(err) => {
                warn!(err = %err, fallback = %FALLBACK_SCREEN, "screen size query failed");
                FALLBACK_SCREEN
            }
        };
        let target = screen.scale_to_fit(self.config.observation.max_dimension);
        debug!(%screen, %target, "capture target resolved");

        let observation = self
            .collaborators
            .capture
            .capture(target)
            .context("capture validation observation")?;
        self.collaborators
            .decision
            .validate(&observation)
            .context("validate decision engine")?;
        Ok(target)
    }

    fn execute(&self, task_id: &str, target: Dimensions, progress: Option<&dyn ProgressSink>) {
        let executor = StepExecutor::new(
            Arc::clone(&self.registry),
            self.collaborators.clone(),
            Arc::clone(&self.pause),
            self.config.step_loop.clone(),
        );
        let request = RunRequest {
            task_id,
            target,
            progress,
        };
        match executor.run(&request) {
            Ok(report) => {
                if let ExecutionOutcome::Failed { error, .. } = &report.outcome {
                    warn!(task_id, err = %error, "task failed");
                }
                self.archive(task_id, Some(&report.profile));
            }
            Err(err) => {
                error!(task_id, err = %format!("{err:#}"), "task run aborted");
                if let Err(err) =
                    self.registry
                        .transition(task_id, TaskStatus::Failed, Some(format!("{err:#}")))
                {
                    debug!(err = %err, "could not mark aborted task failed");
                }
            }
        }
    }

    fn archive(&self, task_id: &str, profile: Option<&ProfileSummary>) {
        let Some(dir) = &self.config.archive_dir else {
            return;
        };
        let Some(task) = self.registry.get(task_id) else {
            return;
        };
        if let Err(err) = archive::write_task(dir, &task, profile) {
            warn!(task_id, err = %format!("{err:#}"), "failed to archive task");
        }
    }
}

/// Marks the active run finished when the task thread exits, even by panic.
struct RunFinished {
    shared: Arc<Shared>,
    task_id: String,
}

impl Drop for RunFinished {
    fn drop(&mut self) {
        if thread::panicking()
            && self.shared.registry.status(&self.task_id) == Some(TaskStatus::Running)
        {
            let _ = self.shared.registry.transition(
                &self.task_id,
                TaskStatus::Failed,
                Some("task thread panicked".to_string()),
            );
        }
        self.shared.release(&self.task_id);
    }
}

pub struct TaskService {
    shared: Arc<Shared>,
}

impl TaskService {
    pub fn new(config: AutopilotConfig, collaborators: Collaborators) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Arc::new(TaskRegistry::new()),
                collaborators,
                pause: Arc::new(PauseGate::new()),
                config,
                active: Mutex::new(None),
                run_finished: Condvar::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    pub fn config(&self) -> &AutopilotConfig {
        &self.shared.config
    }

    /// Admit, initialize and start a task on a background thread.
    ///
    /// A task whose initialization fails is left `Failed` (never `Running`)
    /// and reported as [`ServiceError::Initialization`].
    #[instrument(skip_all)]
    pub fn create_task(
        &self,
        instruction: &str,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CreatedTask, ServiceError> {
        let shared = &self.shared;
        let mut active = shared.lock_active();

        if let Some(running_task_id) = shared.registry.list_running_ids().into_iter().next() {
            return Err(ServiceError::TaskAlreadyRunning { running_task_id });
        }
        if let Some(run) = active.as_ref()
            && !run.finished
        {
            return Err(ServiceError::TaskAlreadyRunning {
                running_task_id: run.task_id.clone(),
            });
        }
        if let Some(handle) = active.take().and_then(|mut run| run.handle.take())
            && handle.join().is_err()
        {
            warn!("previous task thread panicked");
        }

        let task_id = Uuid::new_v4().to_string();
        shared
            .registry
            .create(&task_id, instruction, shared.config.max_steps)?;
        *active = Some(ActiveRun {
            task_id: task_id.clone(),
            handle: None,
            finished: false,
        });
        drop(active);
        info!(task_id = %task_id, "task created");

        let result = self.start(&task_id, progress);
        if result.is_err() {
            shared.release(&task_id);
        }
        result.map(|()| CreatedTask {
            task_id,
            status: TaskStatus::Running,
        })
    }

    /// Initialize a reserved task and spawn its thread.
    fn start(
        &self,
        task_id: &str,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<(), ServiceError> {
        let shared = &self.shared;
        let target = match shared.initialize() {
            Ok(target) => target,
            Err(err) => {
                let message = format!("{err:#}");
                error!(task_id, err = %message, "task initialization failed");
                shared
                    .registry
                    .transition(task_id, TaskStatus::Failed, Some(message.clone()))?;
                shared.archive(task_id, None);
                return Err(ServiceError::Initialization {
                    task_id: task_id.to_string(),
                    message,
                });
            }
        };

        shared
            .registry
            .transition(task_id, TaskStatus::Running, None)?;

        let thread_shared = Arc::clone(shared);
        let thread_task_id = task_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("autopilot-task-{}", &task_id[..8]))
            .spawn(move || {
                let _finished = RunFinished {
                    shared: Arc::clone(&thread_shared),
                    task_id: thread_task_id.clone(),
                };
                thread_shared.execute(&thread_task_id, target, progress.as_deref());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                let message = format!("spawn task thread: {err}");
                shared
                    .registry
                    .transition(task_id, TaskStatus::Failed, Some(message))?;
                return Err(ServiceError::Spawn(err.to_string()));
            }
        };
        shared.attach(task_id, handle);
        Ok(())
    }

    /// Block until the active run (if any) has finished and its thread is joined.
    pub fn join_active(&self) {
        let mut active = self.shared.lock_active();
        while active.as_ref().is_some_and(|run| !run.finished) {
            active = self
                .shared
                .run_finished
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let handle = active.as_mut().and_then(|run| run.handle.take());
        drop(active);
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("task thread panicked");
        }
    }

    pub fn get_status(&self, task_id: &str) -> Result<StatusReport, ServiceError> {
        self.shared
            .registry
            .get(task_id)
            .map(|task| StatusReport::from(&task))
            .ok_or_else(|| not_found(task_id))
    }

    /// Cancel a running task. The loop observes it at its next check.
    pub fn cancel_task(&self, task_id: &str) -> Result<(), ServiceError> {
        let registry = &self.shared.registry;
        let status = registry.status(task_id).ok_or_else(|| not_found(task_id))?;
        if status != TaskStatus::Running {
            return Err(ServiceError::NotRunning {
                task_id: task_id.to_string(),
                status,
            });
        }
        match registry.transition(task_id, TaskStatus::Cancelled, None) {
            Ok(()) => {
                info!(task_id, "task cancelled");
                Ok(())
            }
            Err(RegistryError::InvalidTransition { from, .. }) => Err(ServiceError::NotRunning {
                task_id: task_id.to_string(),
                status: from,
            }),
            Err(err) if err.is_not_found() => Err(not_found(task_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list_tasks(&self) -> Vec<TaskSummary> {
        self.shared
            .registry
            .list()
            .iter()
            .map(Task::summary)
            .collect()
    }

    pub fn latest_observation(&self, task_id: &str) -> Result<Option<Observation>, ServiceError> {
        self.shared
            .registry
            .get(task_id)
            .map(|task| task.latest_observation)
            .ok_or_else(|| not_found(task_id))
    }

    /// Remove a task. A running task's loop stops at its next step record.
    pub fn delete_task(&self, task_id: &str) -> Result<Task, ServiceError> {
        self.shared.registry.remove(task_id).map_err(|err| {
            if err.is_not_found() {
                not_found(task_id)
            } else {
                err.into()
            }
        })
    }

    pub fn pause(&self) {
        self.shared.pause.pause();
    }

    pub fn resume(&self) {
        self.shared.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.pause.is_paused()
    }

    /// Remove tasks older than the configured cleanup age.
    pub fn sweep(&self) -> usize {
        self.shared.registry.sweep(self.shared.config.cleanup_age())
    }

    /// Sweep on a background thread every `interval` until stopped.
    pub fn spawn_sweeper(&self, interval: Duration) -> Result<SweeperHandle> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let registry = Arc::clone(&self.shared.registry);
        let max_age = self.shared.config.cleanup_age();
        let handle = thread::Builder::new()
            .name("autopilot-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let removed = registry.sweep(max_age);
                            debug!(removed, "periodic sweep");
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .context("spawn sweeper thread")?;
        Ok(SweeperHandle {
            stop: stop_tx,
            handle,
        })
    }
}

pub struct SweeperHandle {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("sweeper thread panicked");
        }
    }
}

fn not_found(task_id: &str) -> ServiceError {
    ServiceError::NotFound {
        task_id: task_id.to_string(),
    }
}
