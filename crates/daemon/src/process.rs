//! Bounded subprocess execution shared by the prober, encoder and derived-artifact steps.
//!
//! Every external tool runs through [`run_bounded`]: output is captured, the wait is
//! bounded by a wall-clock limit and an optional cancellation token, and a child that
//! outlives either is killed and reaped before the call returns.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes of stderr kept per process; older output is dropped.
pub const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// How long output is still collected after the child exits. A grandchild that
/// inherited the pipes can keep them open indefinitely.
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Error type for bounded subprocess execution
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started
    #[error("failed to spawn process: {0}")]
    Spawn(std::io::Error),

    /// The process outlived its wall-clock budget and was killed
    #[error("process exceeded its {}s budget and was killed", .limit.as_secs())]
    TimedOut { limit: Duration, pid: Option<u32> },

    /// The caller cancelled the wait and the process was killed
    #[error("process cancelled")]
    Cancelled,

    /// Waiting on the child failed
    #[error("IO error while waiting for process: {0}")]
    Io(std::io::Error),
}

/// Captured result of a process that ran to completion
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `cmd` to completion within `limit`.
///
/// Stdout and stderr are drained concurrently so a chatty child never blocks on a full
/// pipe. If the limit elapses or `cancel` fires first, the child is killed and awaited.
pub async fn run_bounded(
    mut cmd: Command,
    limit: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(ProcessError::Spawn)?;
    let pid = child.id();
    debug!(?pid, "spawned subprocess");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let outcome = {
        let stdout_drain = drain(child.stdout.take(), &mut stdout, usize::MAX);
        let stderr_drain = drain(child.stderr.take(), &mut stderr, STDERR_TAIL_BYTES);
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(stdout_drain, stderr_drain, cancelled, deadline);
        let (mut stdout_done, mut stderr_done) = (false, false);

        let outcome = loop {
            tokio::select! {
                waited = child.wait() => break waited.map_err(ProcessError::Io),
                _ = &mut deadline => break Err(ProcessError::TimedOut { limit, pid }),
                _ = &mut cancelled => break Err(ProcessError::Cancelled),
                _ = &mut stdout_drain, if !stdout_done => stdout_done = true,
                _ = &mut stderr_drain, if !stderr_done => stderr_done = true,
            }
        };

        if outcome.is_ok() && !(stdout_done && stderr_done) {
            let rest = async {
                if !stdout_done {
                    (&mut stdout_drain).await;
                }
                if !stderr_done {
                    (&mut stderr_drain).await;
                }
            };
            if tokio::time::timeout(DRAIN_GRACE, rest).await.is_err() {
                warn!(?pid, "output pipes still open after exit, keeping what was read");
            }
        }
        outcome
    };

    match outcome {
        Ok(status) => Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        }),
        Err(err) => {
            terminate(&mut child, pid).await;
            Err(err)
        }
    }
}

/// Read `pipe` to EOF into `buf`, keeping only the last `cap` bytes.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>, cap: usize) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > cap {
                    let excess = buf.len() - cap;
                    buf.drain(..excess);
                }
            }
        }
    }
}

/// Kill the child and reap it so no zombie or orphan outlives the call.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        warn!(?pid, error = %e, "failed to kill subprocess");
    }
}

/// Keep only the last `max_chars` characters of a diagnostic stream.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max_chars).collect()
}
