//! Child-process execution shared by the simulation harness, executable
//! probes, and the generator command.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::budget::CancelToken;

/// How often a waiting child is checked against the cancel token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the pipes may stay open after the child is gone. A grandchild
/// that inherited them would otherwise hold the caller past its timeout.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Everything observed from one child run.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit status; `None` when the child was killed for a timeout or cancellation.
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    /// Decoded stdout; invalid UTF-8 becomes U+FFFD.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Decoded stderr; invalid UTF-8 becomes U+FFFD.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }
}

/// Spawn `cmd`, optionally feed it `stdin`, and wait at most `timeout`.
///
/// Both pipes are drained on reader threads so a chatty child cannot block.
/// At most `output_limit_bytes` per stream are kept; the rest is counted in
/// the `*_truncated` fields. The wait polls `cancel` and kills the child once
/// it fires.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (done_tx, done_rx) = mpsc::channel();
    let stdout_capture = spawn_reader(stdout, output_limit_bytes, done_tx.clone());
    let stderr_capture = spawn_reader(stderr, output_limit_bytes, done_tx);

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // Dropping the handle closes the pipe so the child sees EOF.
        if let Err(e) = child_stdin.write_all(input) {
            warn!(err = %e, "child closed stdin early");
        }
    }

    let wait = wait_with_cancel(&mut child, timeout, cancel)?;
    let (status, timed_out, cancelled) = match wait {
        WaitOutcome::Exited(status) => (Some(status), false, false),
        WaitOutcome::TimedOut => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            kill_and_reap(&mut child)?;
            (None, true, false)
        }
        WaitOutcome::Cancelled => {
            warn!("command cancelled, killing");
            kill_and_reap(&mut child)?;
            (None, false, true)
        }
    };

    await_readers(&done_rx, 2, PIPE_DRAIN_GRACE)?;
    let (stdout, stdout_truncated) = take_capture(&stdout_capture).context("collect stdout")?;
    let (stderr, stderr_truncated) = take_capture(&stderr_capture).context("collect stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn wait_with_cancel(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<WaitOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Ok(WaitOutcome::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WaitOutcome::TimedOut);
        }
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok(WaitOutcome::Exited(status));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<()> {
    // The child may exit between the last wait and the kill.
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed, child likely already exited");
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

#[derive(Default)]
struct StreamCapture {
    buf: Vec<u8>,
    truncated: usize,
}

type SharedCapture = Arc<Mutex<StreamCapture>>;

/// Drain `reader` on its own thread into a shared buffer, keeping at most
/// `limit` bytes. The outcome is sent on `done` once the pipe closes.
fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
    done: mpsc::Sender<Result<()>>,
) -> SharedCapture {
    let capture = SharedCapture::default();
    let sink = Arc::clone(&capture);
    thread::spawn(move || {
        let outcome = read_stream_limited(reader, limit, &sink);
        // The receiver is gone when the caller stopped waiting.
        let _ = done.send(outcome);
    });
    capture
}

fn read_stream_limited<R: Read>(
    mut reader: R,
    limit: usize,
    capture: &Mutex<StreamCapture>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut capture = capture
            .lock()
            .map_err(|_| anyhow!("output buffer poisoned"))?;
        let keep = n.min(limit.saturating_sub(capture.buf.len()));
        capture.buf.extend_from_slice(&chunk[..keep]);
        capture.truncated += n - keep;
    }
}

/// Wait for `readers` completion messages, giving up after `grace`.
///
/// Giving up leaves the reader threads detached; whatever they captured so
/// far is still returned.
fn await_readers(
    done: &mpsc::Receiver<Result<()>>,
    readers: usize,
    grace: Duration,
) -> Result<()> {
    let deadline = Instant::now() + grace;
    for _ in 0..readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(outcome) => outcome?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "output pipes still open after child exit, returning partial output"
                );
                return Ok(());
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("output reader thread panicked"));
            }
        }
    }
    Ok(())
}

fn take_capture(capture: &SharedCapture) -> Result<(Vec<u8>, usize)> {
    let mut capture = capture
        .lock()
        .map_err(|_| anyhow!("output buffer poisoned"))?;
    let taken = std::mem::take(&mut *capture);
    Ok((taken.buf, taken.truncated))
}
