//! Testing utilities: a scripted stand-in for the PTY launcher.
//!
//! [`ScriptedLauncher`] hands out fake processes whose output is decided by
//! a script keyed on each line written to them. Everything a process sees
//! and does is recorded so tests can assert on it.

use crate::process::{LaunchSpec, LaunchedProcess, ManagedProcess, ProcessEvent, ProcessLauncher};
use async_trait::async_trait;
use bridge_proto::BridgeError;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// What a fake process does after a line is written to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Emit these chunks, in order.
    Chunks(Vec<String>),
    /// Emit nothing.
    Silent,
    /// Emit these chunks, then exit with `code`.
    Exit { chunks: Vec<String>, code: i32 },
}

impl ScriptedReply {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedReply::Chunks(chunks.into_iter().map(Into::into).collect())
    }
}

type Script = dyn Fn(&str) -> ScriptedReply + Send + Sync;

#[derive(Debug, Default)]
struct Log {
    specs: Vec<LaunchSpec>,
    writes: Vec<String>,
    resizes: Vec<(u16, u16)>,
    terminations: Vec<bool>,
}

/// Launcher producing scripted fake processes.
#[derive(Clone)]
pub struct ScriptedLauncher {
    script: Arc<Script>,
    banner: Vec<String>,
    log: Arc<Mutex<Log>>,
    launches: Arc<AtomicUsize>,
    next_pid: Arc<AtomicU32>,
}

impl std::fmt::Debug for ScriptedLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedLauncher")
            .field("launches", &self.launch_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedLauncher {
    /// `script` maps each written line (terminator removed) to a reply.
    pub fn new(script: impl Fn(&str) -> ScriptedReply + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            banner: Vec::new(),
            log: Arc::new(Mutex::new(Log::default())),
            launches: Arc::new(AtomicUsize::new(0)),
            next_pid: Arc::new(AtomicU32::new(4000)),
        }
    }

    /// Output emitted as soon as a process starts.
    #[must_use]
    pub fn with_banner<I, S>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.banner = chunks.into_iter().map(Into::into).collect();
        self
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.log().specs.clone()
    }

    /// Every line written to any process, in order.
    pub fn writes(&self) -> Vec<String> {
        self.log().writes.clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.log().resizes.clone()
    }

    /// One entry per `terminate` call: `true` when graceful.
    pub fn terminations(&self) -> Vec<bool> {
        self.log().terminations.clone()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess, BridgeError> {
        let (tx, events) = mpsc::channel(256);
        for chunk in &self.banner {
            let _ = tx.try_send(ProcessEvent::Output(chunk.clone().into_bytes()));
        }

        self.log().specs.push(spec);
        self.launches.fetch_add(1, Ordering::SeqCst);

        let process = ScriptedProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
            events: Some(tx),
            exit_code: None,
        };
        Ok(LaunchedProcess {
            process: Box::new(process),
            events,
        })
    }
}

struct ScriptedProcess {
    pid: u32,
    script: Arc<Script>,
    log: Arc<Mutex<Log>>,
    events: Option<mpsc::Sender<ProcessEvent>>,
    exit_code: Option<i32>,
}

impl ScriptedProcess {
    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, chunks: &[String]) {
        if let Some(tx) = &self.events {
            for chunk in chunks {
                let _ = tx.try_send(ProcessEvent::Output(chunk.clone().into_bytes()));
            }
        }
    }
}

#[async_trait]
impl ManagedProcess for ScriptedProcess {
    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.events.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process exited"));
        }
        let text = String::from_utf8_lossy(data);
        let line = text.trim_end_matches(['\r', '\n']).to_string();
        self.log().writes.push(line.clone());

        match (self.script)(&line) {
            ScriptedReply::Chunks(chunks) => self.emit(&chunks),
            ScriptedReply::Silent => {}
            ScriptedReply::Exit { chunks, code } => {
                self.emit(&chunks);
                self.exit_code = Some(code);
                if let Some(tx) = self.events.take() {
                    let _ = tx.try_send(ProcessEvent::Eof);
                }
            }
        }
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        self.log().resizes.push((cols, rows));
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exit_code)
    }

    async fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        self.log().terminations.push(graceful);
        self.events = None;
        if self.exit_code.is_none() {
            self.exit_code = Some(if graceful { 143 } else { 137 });
        }
        Ok(())
    }
}
