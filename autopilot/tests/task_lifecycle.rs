use std::sync::Arc;
use std::thread;
use std::time::Duration;

use autopilot::core::classifier::ActionPlan;
use autopilot::core::command::{Command, MouseButton, Platform};
use autopilot::core::types::TaskStatus;
use autopilot::io::archive::load_task;
use autopilot::io::config::{AutopilotConfig, LoopConfig};
use autopilot::io::decision::Decision;
use autopilot::io::dispatcher::{ActionDispatcher, InProcessBackend, InputDriver};
use autopilot::io::progress::{ChannelProgress, ProgressSink};
use autopilot::service::{ServiceError, TaskService};
use autopilot::step::Collaborators;
use autopilot::test_support::{
    RecordingDriver, ScriptedDecision, StaticCapture, wait_for_status, wait_for_steps,
};

fn config(max_steps: u32) -> AutopilotConfig {
    AutopilotConfig {
        max_steps,
        step_loop: LoopConfig::immediate(),
        ..AutopilotConfig::default()
    }
}

fn in_process_service(
    cfg: AutopilotConfig,
    decision: ScriptedDecision,
) -> (TaskService, Arc<RecordingDriver>) {
    let driver = Arc::new(RecordingDriver::new());
    let dispatcher = ActionDispatcher::new(InProcessBackend::new(
        Arc::clone(&driver) as Arc<dyn InputDriver>,
        Platform::Linux,
    ));
    let service = TaskService::new(
        cfg,
        Collaborators {
            decision: Arc::new(decision),
            capture: Arc::new(StaticCapture::new()),
            dispatcher: Arc::new(dispatcher),
        },
    );
    (service, driver)
}

fn click(x: i32, y: i32) -> Command {
    Command::Click {
        x,
        y,
        clicks: 1,
        button: MouseButton::Left,
        hold_keys: Vec::new(),
    }
}

/// Decision engine that keeps asking for another step, slowly enough for the
/// test thread to interleave.
fn slow_next() -> ScriptedDecision {
    ScriptedDecision::always(Decision::plan(ActionPlan::Next).with_plan("keep looking"))
        .with_hook(|_| thread::sleep(Duration::from_millis(10)))
}

#[test]
fn open_calculator_completes_after_three_steps() {
    let (service, driver) = in_process_service(
        config(15),
        ScriptedDecision::new(vec![
            Decision::plan(ActionPlan::Next).with_plan("locate the dock"),
            Decision::execute(vec![click(640, 1040)]).with_plan("click the calculator icon"),
            Decision::text("DONE").with_plan("calculator is open"),
        ]),
    );

    let created = service.create_task("open calculator", None).expect("create");
    service.join_active();

    let status = service.get_status(&created.task_id).expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.current_step, 3);
    assert!(status.error.is_none());
    assert_eq!(status.plan_history.len(), 3);
    assert_eq!(
        driver.calls(),
        vec!["move 640,1040", "click 640,1040 left x1"]
    );

    let task = service.registry().get(&created.task_id).expect("task");
    assert_eq!(task.steps.len() as u32, task.current_step);
    assert!(task.completed_at.is_some());
}

#[test]
fn always_next_completes_at_step_budget() {
    let (service, _driver) = in_process_service(
        config(5),
        ScriptedDecision::always(Decision::text("next")),
    );

    let created = service.create_task("never done", None).expect("create");
    service.join_active();

    let status = service.get_status(&created.task_id).expect("status");
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.current_step, 5);
    assert!(status.error.is_none());
    assert_eq!(status.message.as_deref(), Some("reached maximum steps (5)"));
}

#[test]
fn second_task_is_rejected_while_one_runs() {
    let (service, _driver) = in_process_service(config(200), slow_next());

    let first = service.create_task("first", None).expect("first");
    let err = service.create_task("second", None).unwrap_err();
    assert_eq!(
        err,
        ServiceError::TaskAlreadyRunning {
            running_task_id: first.task_id.clone()
        }
    );
    assert_eq!(service.list_tasks().len(), 1);

    service.cancel_task(&first.task_id).expect("cancel");
    service.join_active();

    let again = service.create_task("third", None).expect("admitted after cancel");
    service.cancel_task(&again.task_id).expect("cancel third");
    service.join_active();
}

#[test]
fn cancellation_mid_loop_stops_further_steps() {
    let (service, _driver) = in_process_service(config(200), slow_next());

    let created = service.create_task("scroll forever", None).expect("create");
    assert!(wait_for_steps(
        service.registry(),
        &created.task_id,
        2,
        Duration::from_secs(5)
    ));
    service.cancel_task(&created.task_id).expect("cancel");
    service.join_active();

    let steps_at_exit = service
        .registry()
        .get(&created.task_id)
        .expect("task")
        .current_step;
    thread::sleep(Duration::from_millis(50));
    let task = service.registry().get(&created.task_id).expect("task");
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.current_step, steps_at_exit);
    assert!(task.current_step < 200);

    assert!(matches!(
        service.cancel_task(&created.task_id),
        Err(ServiceError::NotRunning {
            status: TaskStatus::Cancelled,
            ..
        })
    ));
}

#[test]
fn initialization_failure_never_reaches_running() {
    let (service, _driver) = in_process_service(
        config(5),
        ScriptedDecision::new(Vec::new()).failing_validation("connection refused"),
    );

    let err = service.create_task("x", None).unwrap_err();
    let ServiceError::Initialization { task_id, .. } = err else {
        panic!("expected initialization error");
    };
    let status = service.get_status(&task_id).expect("status");
    assert_eq!(status.status, TaskStatus::Failed);
    assert!(
        status
            .error
            .as_deref()
            .is_some_and(|e| e.contains("connection refused"))
    );

    assert!(service.registry().list_running_ids().is_empty());
}

#[test]
fn paused_task_makes_no_progress_until_resumed() {
    let (service, _driver) = in_process_service(
        config(5),
        ScriptedDecision::new(vec![Decision::plan(ActionPlan::Done)]),
    );
    service.pause();

    let created = service.create_task("x", None).expect("create");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        service
            .registry()
            .get(&created.task_id)
            .expect("task")
            .current_step,
        0
    );
    assert_eq!(
        service.get_status(&created.task_id).expect("status").status,
        TaskStatus::Running
    );

    service.resume();
    let status = wait_for_status(
        service.registry(),
        &created.task_id,
        Duration::from_secs(5),
        TaskStatus::is_terminal,
    );
    assert_eq!(status, Some(TaskStatus::Completed));
    service.join_active();
}

#[test]
fn progress_updates_arrive_through_channel() {
    let (service, _driver) = in_process_service(
        config(5),
        ScriptedDecision::new(vec![
            Decision::plan(ActionPlan::Next).with_plan("x".repeat(150)),
            Decision::plan(ActionPlan::Done).with_plan("finished"),
        ]),
    );
    let (sink, rx) = ChannelProgress::bounded(16);
    let sink: Arc<dyn ProgressSink> = Arc::new(sink);

    let created = service.create_task("x", Some(sink)).expect("create");
    service.join_active();

    let updates: Vec<_> = rx.try_iter().collect();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| u.task_id == created.task_id));
    assert_eq!(updates[0].plan_excerpt.len(), 100);
    assert_eq!(updates[1].description(), "Step 2/5: finished");
}

#[test]
fn finished_task_is_archived_when_configured() {
    let temp = tempfile::tempdir().expect("tempdir");
    let cfg = AutopilotConfig {
        archive_dir: Some(temp.path().to_path_buf()),
        ..config(5)
    };
    let (service, _driver) = in_process_service(
        cfg,
        ScriptedDecision::new(vec![Decision::plan(ActionPlan::Done).with_plan("nothing to do")]),
    );

    let created = service.create_task("archive me", None).expect("create");
    service.join_active();

    let archived = load_task(temp.path(), &created.task_id).expect("load");
    assert_eq!(archived.status, TaskStatus::Completed);
    assert_eq!(archived.instruction, "archive me");
    assert!(archived.latest_observation.is_some());
    let profile = std::fs::read_to_string(temp.path().join(&created.task_id).join("profile.txt"))
        .expect("profile");
    assert!(profile.contains("observation-capture"));
}

#[cfg(unix)]
mod external_executor {
    use super::*;
    use autopilot::io::dispatcher::ExternalProcessBackend;

    /// Executor stub: answers `screenSize` immediately, hangs on anything else.
    const STUB: &str = r#"case "$2" in *screenSize*) printf '{"width":1280,"height":800}' ;; *) exec sleep 5 ;; esac"#;

    #[test]
    fn slow_executor_times_out_and_task_keeps_running() {
        let backend = ExternalProcessBackend::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                STUB.to_string(),
                "robotgo_executor".to_string(),
            ],
            Platform::Linux,
        )
        .with_timeouts(Duration::from_millis(200), Duration::from_secs(5));
        let service = TaskService::new(
            config(5),
            Collaborators {
                decision: Arc::new(ScriptedDecision::new(vec![
                    Decision::execute(vec![click(10, 10)]),
                    Decision::plan(ActionPlan::Done),
                ])),
                capture: Arc::new(StaticCapture::new()),
                dispatcher: Arc::new(ActionDispatcher::new(backend)),
            },
        );

        let created = service.create_task("click something", None).expect("create");
        service.join_active();

        let task = service.registry().get(&created.task_id).expect("task");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.steps.len(), 2);
        let error = task.steps[0].error.as_deref().expect("timeout recorded");
        assert!(error.contains("timed out"), "{error}");
        assert!(task.steps[1].error.is_none());
        let observation = task.latest_observation.expect("observation");
        assert_eq!(observation.size.width, 1280);
    }
}
