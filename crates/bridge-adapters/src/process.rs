//! Managed processes behind a narrow interface.
//!
//! The session manager only sees [`ManagedProcess`] (write, resize,
//! terminate, try_wait) and a stream of [`ProcessEvent`]s. [`PtyLauncher`]
//! is the real implementation on top of `portable-pty`: a blocking reader
//! thread forwards PTY output over a bounded channel.

// PIDs always fit in i32 in practice
#![allow(clippy::cast_possible_wrap)]

use crate::backend::CliInvocation;
use async_trait::async_trait;
use bridge_proto::BridgeError;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use portable_pty::{Child, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Capacity of the output channel between reader thread and session task.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Output events from a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Raw bytes, in emission order.
    Output(Vec<u8>),
    /// The output side closed (process exited).
    Eof,
    /// Reading failed.
    ReadError(String),
}

/// Control surface of a running process.
#[async_trait]
pub trait ManagedProcess: Send {
    fn process_id(&self) -> Option<u32>;

    /// Writes bytes to the process input.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()>;

    /// Exit code if the process has exited.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Stops the process. Graceful termination sends SIGTERM and waits
    /// briefly before SIGKILL.
    async fn terminate(&mut self, graceful: bool) -> io::Result<()>;
}

/// A launched process and its output stream.
pub struct LaunchedProcess {
    pub process: Box<dyn ManagedProcess>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.process.process_id())
            .finish_non_exhaustive()
    }
}

/// Everything needed to start a session process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl LaunchSpec {
    /// Terminal-flavoured spec: `TERM=xterm-256color`, `FORCE_COLOR=1`.
    pub fn new(invocation: &CliInvocation, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            cwd: cwd.into(),
            env: vec![
                ("TERM".to_string(), "xterm-256color".to_string()),
                ("FORCE_COLOR".to_string(), "1".to_string()),
            ],
            cols: 80,
            rows: 24,
        }
    }

    #[must_use]
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}

/// Starts session processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess, BridgeError>;
}

/// Launches processes inside a pseudo-terminal.
#[derive(Debug, Clone)]
pub struct PtyLauncher {
    open_attempts: u32,
    backoff_base: Duration,
}

impl Default for PtyLauncher {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

impl PtyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a PTY, retrying with `backoff_base * 2^attempt` between tries.
    async fn open_pty(&self, size: PtySize) -> Result<PtyPair, BridgeError> {
        let mut last_error = String::new();

        for attempt in 0..self.open_attempts {
            let opened = native_pty_system()
                .openpty(size)
                .map_err(|e| e.to_string());
            match opened {
                Ok(pair) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "PTY allocated after retry");
                    }
                    return Ok(pair);
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Failed to allocate PTY");
                    last_error = e;
                }
            }

            if attempt + 1 < self.open_attempts {
                let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
                tokio::time::sleep(self.backoff_base.saturating_mul(factor)).await;
            }
        }

        Err(BridgeError::backend(format!(
            "failed to allocate pseudo-terminal after {} attempts: {last_error}",
            self.open_attempts
        )))
    }
}

#[async_trait]
impl ProcessLauncher for PtyLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess, BridgeError> {
        let pair = self
            .open_pty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .await?;

        let mut builder = CommandBuilder::new(&spec.program);
        builder.args(&spec.args);
        builder.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            builder.env(key, value);
        }

        let child = pair.slave.spawn_command(builder).map_err(|e| {
            warn!(program = %spec.program.display(), error = %e, "PTY spawn failed");
            BridgeError::SpawnFailure("the CLI process could not be started".to_string())
        })?;
        // Drop the slave so the reader sees EOF once the child exits
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::backend(format!("PTY reader unavailable: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BridgeError::backend(format!("PTY writer unavailable: {e}")))?;

        let stop_reader = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_reader(reader, tx, Arc::clone(&stop_reader));

        debug!(
            program = %spec.program.display(),
            cwd = %spec.cwd.display(),
            pid = ?child.process_id(),
            "Spawned PTY process"
        );

        Ok(LaunchedProcess {
            process: Box::new(PtyProcess {
                master: pair.master,
                writer,
                child,
                stop_reader,
            }),
            events: rx,
        })
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<ProcessEvent>,
    stop: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            if stop.load(Ordering::SeqCst) {
                debug!("PTY reader: termination requested");
                break;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader: EOF");
                    let _ = tx.blocking_send(ProcessEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(error = %e, "PTY reader error");
                    let _ = tx.blocking_send(ProcessEvent::ReadError(e.to_string()));
                    break;
                }
            }
        }
    });
}

struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    stop_reader: Arc<AtomicBool>,
}

#[async_trait]
impl ManagedProcess for PtyProcess {
    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }

    async fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        self.stop_reader.store(true, Ordering::SeqCst);

        let pid = match self.child.process_id() {
            Some(id) => Pid::from_raw(id as i32),
            None => return Ok(()),
        };
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        if graceful {
            debug!(%pid, "Sending SIGTERM");
            let _ = kill(pid, Signal::SIGTERM);

            let grace_period = Duration::from_secs(2);
            let start = Instant::now();
            while start.elapsed() < grace_period {
                if self.child.try_wait()?.is_some() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            debug!(%pid, "Grace period expired, sending SIGKILL");
        }

        let _ = kill(pid, Signal::SIGKILL);
        // Reap so the child does not linger as a zombie
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(1) {
            if self.child.try_wait()?.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}
