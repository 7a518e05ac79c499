//! One-shot headless execution.
//!
//! Spawns the CLI with the command as a non-interactive flag, reads stdout
//! and stderr concurrently, and forwards each line to an optional progress
//! channel. A timeout sends SIGTERM and reports a `timeout` error.

use crate::backend::{CliBackend, OutputFormat};
use bridge_proto::{
    BridgeError, ExecutionMode, ExecutionResult, OutputChunk, OutputPayload, OutputStream,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Runs single commands through a [`CliBackend`].
#[derive(Debug, Clone)]
pub struct HeadlessExecutor {
    backend: CliBackend,
}

impl HeadlessExecutor {
    pub fn new(backend: CliBackend) -> Self {
        Self { backend }
    }

    /// Executes `command` once.
    ///
    /// Returns `Ok` with a failed result for a non-zero exit. Returns `Err`
    /// for spawn failures (fatal) and timeouts (retryable by the caller).
    pub async fn run(
        &self,
        command: &str,
        work_dir: Option<&Path>,
        timeout: Duration,
        format: OutputFormat,
        progress: Option<&mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecutionResult, BridgeError> {
        let started = Instant::now();
        let mode = match format {
            OutputFormat::Json => ExecutionMode::Headless,
            OutputFormat::Text => ExecutionMode::Simple,
        };
        let invocation = self.backend.headless(command, format);

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }

        debug!(
            program = %invocation.program.display(),
            cwd = ?work_dir,
            timeout_secs = timeout.as_secs(),
            "Spawning headless CLI"
        );

        let mut child = cmd.spawn().map_err(|e| {
            warn!(program = %invocation.program.display(), error = %e, "Headless spawn failed");
            BridgeError::SpawnFailure(format!("the CLI process could not be started ({})", e.kind()))
        })?;

        // Both pipes are drained concurrently so a full stderr buffer cannot
        // stall stdout.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let streams = async {
            tokio::try_join!(
                read_stream(stdout, OutputStream::Stdout, progress),
                read_stream(stderr, OutputStream::Stderr, progress),
            )
        };

        let (stdout, stderr) = match tokio::time::timeout(timeout, streams).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "Headless execution timed out, sending SIGTERM"
                );
                terminate_child(&mut child).await;
                return Err(BridgeError::timeout(format!(
                    "no response within {}s",
                    timeout.as_secs()
                )));
            }
        };

        let status = child.wait().await?;
        let elapsed = started.elapsed();
        debug!(code = ?status.code(), elapsed_ms = elapsed.as_millis() as u64, "Headless CLI exited");

        let payload = match format {
            OutputFormat::Json => OutputPayload::parse(&stdout),
            OutputFormat::Text => OutputPayload::Text(stdout),
        };

        if status.success() {
            Ok(ExecutionResult::succeeded(mode, command, payload, elapsed, None))
        } else {
            let err = BridgeError::ExitStatus {
                code: status.code(),
                stderr: stderr.trim_end().to_string(),
            };
            Ok(ExecutionResult::failed(mode, command, payload, elapsed, None, &err))
        }
    }
}

async fn read_stream(
    pipe: Option<impl AsyncRead + Unpin>,
    stream: OutputStream,
    progress: Option<&mpsc::UnboundedSender<OutputChunk>>,
) -> std::io::Result<String> {
    let mut collected = String::new();
    let Some(pipe) = pipe else {
        return Ok(collected);
    };

    // Lines are decoded lossily; stray non-UTF-8 bytes must not fail the run
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf);
        collected.push_str(&line);
        collected.push('\n');
        if let Some(tx) = progress {
            // A dropped progress receiver is not an execution failure
            let _ = tx.send(OutputChunk {
                stream,
                data: format!("{line}\n"),
            });
        }
    }
    Ok(collected)
}

/// SIGTERM, a short grace period, then SIGKILL.
async fn terminate_child(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let pid = Pid::from_raw(pid as i32);
        debug!(%pid, "Sending SIGTERM to headless child");
        let _ = kill(pid, Signal::SIGTERM);
    }

    if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
        debug!("Grace period expired, killing headless child");
        let _ = child.kill().await;
    }
}
