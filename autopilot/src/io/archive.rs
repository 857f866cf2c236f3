//! On-disk archive of finished tasks.
//!
//! Layout under the archive root:
//!
//! ```text
//! <root>/<task_id>/task.json        task record (observation excluded)
//! <root>/<task_id>/observation.png  latest observation, when one exists
//! <root>/<task_id>/profile.txt      profile summary table of the run
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{Dimensions, Observation, Task};
use crate::profiler::ProfileSummary;

const TASK_FILE: &str = "task.json";
const OBSERVATION_FILE: &str = "observation.png";
const OBSERVATION_META_FILE: &str = "observation.json";
const PROFILE_FILE: &str = "profile.txt";

pub fn task_dir(root: &Path, task_id: &str) -> PathBuf {
    root.join(task_id)
}

/// Write a task snapshot and its run profile.
pub fn write_task(root: &Path, task: &Task, profile: Option<&ProfileSummary>) -> Result<PathBuf> {
    let dir = task_dir(root, &task.id);
    let mut json = serde_json::to_vec_pretty(task).context("serialize task json")?;
    json.push(b'\n');
    write_atomic(&dir.join(TASK_FILE), &json)?;

    if let Some(observation) = &task.latest_observation {
        write_atomic(&dir.join(OBSERVATION_FILE), &observation.bytes)?;
        let meta = serde_json::to_vec(&observation.size).context("serialize observation size")?;
        write_atomic(&dir.join(OBSERVATION_META_FILE), &meta)?;
    }
    if let Some(profile) = profile {
        write_atomic(&dir.join(PROFILE_FILE), format!("{profile}\n").as_bytes())?;
    }
    debug!(task_id = %task.id, dir = %dir.display(), "task archived");
    Ok(dir)
}

/// Read an archived task, reattaching its observation when present.
pub fn load_task(root: &Path, task_id: &str) -> Result<Task> {
    let dir = task_dir(root, task_id);
    let path = dir.join(TASK_FILE);
    let contents = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    let mut task: Task =
        serde_json::from_slice(&contents).with_context(|| format!("parse {}", path.display()))?;

    let image = dir.join(OBSERVATION_FILE);
    if image.exists() {
        let bytes = fs::read(&image).with_context(|| format!("read {}", image.display()))?;
        let meta = dir.join(OBSERVATION_META_FILE);
        let size = match fs::read(&meta) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parse {}", meta.display()))?,
            Err(_) => Dimensions::new(0, 0),
        };
        task.latest_observation = Some(Observation::new(bytes, size));
    }
    Ok(task)
}

/// Write a file via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StepRecord, TaskStatus};
    use crate::profiler::Profiler;

    fn finished_task() -> Task {
        let mut task = Task::new("task-1", "open calculator", 5);
        task.status = TaskStatus::Completed;
        task.current_step = 1;
        task.steps.push(StepRecord {
            plan: Some("click the dock".to_string()),
            action_description: Some("DONE".to_string()),
            ..StepRecord::new(1)
        });
        task.latest_observation = Some(Observation::new(
            vec![0x89, b'P', b'N', b'G'],
            Dimensions::new(640, 480),
        ));
        task
    }

    #[test]
    fn write_then_load_restores_task_and_observation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let task = finished_task();

        let dir = write_task(temp.path(), &task, None).expect("write");
        assert!(dir.join(TASK_FILE).exists());
        assert!(!dir.join(PROFILE_FILE).exists());

        let loaded = load_task(temp.path(), "task-1").expect("load");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.steps, task.steps);
        assert_eq!(loaded.latest_observation, task.latest_observation);
    }

    #[test]
    fn profile_summary_is_written_as_table() {
        let temp = tempfile::tempdir().expect("tempdir");
        let profiler = Profiler::new();
        drop(profiler.scope("step", None));

        let dir = write_task(temp.path(), &finished_task(), Some(&profiler.summary()))
            .expect("write");
        let table = fs::read_to_string(dir.join(PROFILE_FILE)).expect("read");
        assert!(table.contains("step"));
        assert!(table.contains("total execution"));
    }

    #[test]
    fn task_without_observation_loads_without_one() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut task = finished_task();
        task.latest_observation = None;
        write_task(temp.path(), &task, None).expect("write");

        let loaded = load_task(temp.path(), "task-1").expect("load");
        assert!(loaded.latest_observation.is_none());
    }

    #[test]
    fn missing_task_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_task(temp.path(), "nope").unwrap_err();
        assert!(err.to_string().contains("task.json"));
    }

    #[test]
    fn write_atomic_leaves_no_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a/b/file.txt");
        write_atomic(&path, b"one").expect("first");
        write_atomic(&path, b"two").expect("second");
        assert_eq!(fs::read(&path).expect("read"), b"two");
        assert!(!temp.path().join("a/b/file.txt.tmp").exists());
    }
}
