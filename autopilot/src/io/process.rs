//! Executor process invocation with a hard deadline and capped output.
//!
//! The call returns within `timeout` plus [`DRAIN_GRACE`] even when the
//! executor leaves a descendant holding its stdout or stderr open: readers
//! that have not reached end-of-stream by then are detached and whatever they
//! captured so far is returned.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long readers may keep draining after the child has been reaped.
pub const DRAIN_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// A stream was still open at the drain deadline.
    pub detached: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Trimmed stderr, with a truncation notice when bytes were discarded.
    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).trim().to_string();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(" [stderr truncated {} bytes]", self.stderr_truncated));
        }
        text
    }
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let keep = chunk.len().min(limit.saturating_sub(self.bytes.len()));
        self.bytes.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

/// One pipe drained on its own thread into a shared buffer.
struct StreamTap {
    label: &'static str,
    captured: Arc<Mutex<Captured>>,
    finished: Receiver<Result<()>>,
}

impl StreamTap {
    fn spawn<R: Read + Send + 'static>(label: &'static str, mut stream: R, limit: usize) -> Result<Self> {
        let captured = Arc::new(Mutex::new(Captured::default()));
        let sink = Arc::clone(&captured);
        let (done, finished) = mpsc::channel();
        thread::Builder::new()
            .name(format!("executor-{label}"))
            .spawn(move || {
                let mut chunk = [0u8; 8192];
                let result = loop {
                    match stream.read(&mut chunk) {
                        Ok(0) => break Ok(()),
                        Ok(n) => sink
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(&chunk[..n], limit),
                        Err(err) => break Err(anyhow!(err).context(format!("read {label}"))),
                    }
                };
                let _ = done.send(result);
            })
            .with_context(|| format!("spawn {label} reader"))?;
        Ok(Self {
            label,
            captured,
            finished,
        })
    }

    /// Wait for end-of-stream until `deadline`, then take what was captured.
    /// The flag is true when the stream was still open at the deadline.
    fn collect(self, deadline: Instant) -> Result<(Captured, bool)> {
        let wait = deadline.saturating_duration_since(Instant::now());
        let detached = match self.finished.recv_timeout(wait) {
            Ok(result) => {
                result?;
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(stream = self.label, "stream still held open after exit, detaching reader");
                true
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("{} reader exited without reporting", self.label));
            }
        };
        let captured = std::mem::take(&mut *self.captured.lock().unwrap_or_else(PoisonError::into_inner));
        Ok((captured, detached))
    }
}

/// Reap the child, killing it once `timeout` has elapsed. Returns the exit
/// status and whether the kill was needed.
fn reap(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(timeout).context("wait for executor")? {
        return Ok((status, false));
    }
    warn!(timeout_ms = timeout.as_millis() as u64, "executor timed out, killing");
    child.kill().context("kill executor")?;
    let status = child.wait().context("reap killed executor")?;
    Ok((status, true))
}

/// Run an executor command, killing it after `timeout`.
///
/// At most `output_limit_bytes` of each stream is kept; the rest is counted
/// and discarded while the pipe keeps draining.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_ms = timeout.as_millis() as u64))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning executor");
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn executor");
        anyhow!(err).context("spawn executor")
    })?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = StreamTap::spawn("stdout", stdout, output_limit_bytes)?;
    let stderr = StreamTap::spawn("stderr", stderr, output_limit_bytes)?;

    let (status, timed_out) = reap(&mut child, timeout)?;

    let deadline = Instant::now() + DRAIN_GRACE;
    let (stdout, stdout_detached) = stdout.collect(deadline)?;
    let (stderr, stderr_detached) = stderr.collect(deadline)?;

    if stdout.truncated > 0 || stderr.truncated > 0 {
        warn!(
            stdout_truncated = stdout.truncated,
            stderr_truncated = stderr.truncated,
            "executor output truncated"
        );
    }

    let detached = stdout_detached || stderr_detached;
    debug!(exit_code = ?status.code(), timed_out, detached, "executor finished");
    Ok(CommandOutput {
        status,
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        stdout_truncated: stdout.truncated,
        stderr_truncated: stderr.truncated,
        timed_out,
        detached,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let output =
            run_command_with_timeout(sh("echo '{\"width\":800}'"), Duration::from_secs(5), 1024)
                .expect("run");
        assert!(output.success());
        assert!(!output.detached);
        assert_eq!(output.stdout_text().trim(), "{\"width\":800}");
    }

    #[test]
    fn non_zero_exit_keeps_stderr() {
        let output = run_command_with_timeout(
            sh("echo 'no display' >&2; exit 3"),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert!(!output.success());
        assert!(!output.timed_out);
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr_text(), "no display");
    }

    #[test]
    fn slow_child_is_killed_at_timeout() {
        let output = run_command_with_timeout(sh("exec sleep 5"), Duration::from_millis(100), 1024)
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
    }

    #[test]
    fn descendant_holding_pipes_does_not_extend_timeout() {
        // `sh` forks `sleep`, which inherits stdout/stderr and outlives the kill.
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("echo started; sleep 3; true"),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
        assert!(output.timed_out);
        assert!(output.detached);
        assert_eq!(output.stdout_text().trim(), "started");
    }

    #[test]
    fn output_beyond_limit_is_counted_not_kept() {
        let output = run_command_with_timeout(sh("printf 'abcdefghij'"), Duration::from_secs(5), 4)
            .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
    }
}
