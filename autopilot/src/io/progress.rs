//! Progress notifications emitted after each recorded step.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use anyhow::{Result, anyhow};
use serde::Serialize;

/// Longest plan excerpt carried by an update, in characters.
pub const PLAN_EXCERPT_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub step: u32,
    pub max_steps: u32,
    pub plan_excerpt: String,
}

impl ProgressUpdate {
    pub fn new(task_id: &str, step: u32, max_steps: u32, plan: Option<&str>) -> Self {
        Self {
            task_id: task_id.to_string(),
            step,
            max_steps,
            plan_excerpt: plan
                .unwrap_or_default()
                .chars()
                .take(PLAN_EXCERPT_CHARS)
                .collect(),
        }
    }

    /// `Step 2/15: <excerpt>`
    pub fn description(&self) -> String {
        format!("Step {}/{}: {}", self.step, self.max_steps, self.plan_excerpt)
    }
}

/// Receives progress updates. Failures are logged by the caller and never
/// affect the task.
pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate) -> Result<()>;
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressUpdate) -> Result<()> + Send + Sync,
{
    fn report(&self, update: &ProgressUpdate) -> Result<()> {
        self(update)
    }
}

/// Bounded channel bridge; a full or disconnected channel is a reporting
/// failure, not a blocked step loop.
#[derive(Debug)]
pub struct ChannelProgress {
    tx: SyncSender<ProgressUpdate>,
}

impl ChannelProgress {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, update: &ProgressUpdate) -> Result<()> {
        self.tx.try_send(update.clone()).map_err(|err| match err {
            TrySendError::Full(_) => anyhow!("progress channel full"),
            TrySendError::Disconnected(_) => anyhow!("progress receiver dropped"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_is_truncated_on_char_boundaries() {
        let plan = "é".repeat(150);
        let update = ProgressUpdate::new("t", 2, 15, Some(&plan));
        assert_eq!(update.plan_excerpt.chars().count(), PLAN_EXCERPT_CHARS);
        assert!(update.description().starts_with("Step 2/15: é"));
    }

    #[test]
    fn missing_plan_gives_empty_excerpt() {
        let update = ProgressUpdate::new("t", 1, 3, None);
        assert_eq!(update.description(), "Step 1/3: ");
    }

    #[test]
    fn channel_reports_full_instead_of_blocking() {
        let (sink, rx) = ChannelProgress::bounded(1);
        let update = ProgressUpdate::new("t", 1, 3, Some("plan"));
        sink.report(&update).expect("first fits");
        let err = sink.report(&update).unwrap_err();
        assert!(err.to_string().contains("full"));

        assert_eq!(rx.recv().expect("recv"), update);
        drop(rx);
        assert!(sink.report(&update).is_err());
    }
}
