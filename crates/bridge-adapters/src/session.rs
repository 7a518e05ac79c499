//! Interactive session manager.
//!
//! Every session is an actor task that exclusively owns its process. Callers
//! talk to it through a [`SessionHandle`] over an mpsc command channel, so
//! input writes are serialized by construction and at most one `send` is in
//! flight per session.
//!
//! The actor forwards every output chunk to the [`SessionRegistry`] and
//! scans the ANSI-stripped text accumulated since the pending send for
//! completion. A send resolves when:
//! - the completion heuristic fires (success),
//! - the process exits (success iff exit code 0),
//! - the hard timeout elapses (process killed, retryable `timeout` error),
//! - the session is stopped (`session` error).

use crate::backend::CliInvocation;
use crate::completion::{AnsiStripper, CompletionMatcher, MatcherChain, ScanState};
use crate::process::{LaunchSpec, LaunchedProcess, ManagedProcess, ProcessEvent, ProcessLauncher};
use bridge_core::{SessionConfig, SessionRegistry};
use bridge_proto::{BridgeError, CloseReason, SessionState};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// What a resolved send returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReply {
    /// ANSI-stripped output produced since the send.
    pub output: String,
    /// Set when the process exited instead of completing.
    pub exit_code: Option<i32>,
}

enum SessionCommand {
    Send {
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<SessionReply, BridgeError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Stop {
        reason: CloseReason,
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    pid: Option<u32>,
    created_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed() || self.commands.is_closed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Watch channel publishing every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Writes `command` plus a line terminator and waits for it to resolve.
    pub async fn send(&self, command: &str, timeout: Duration) -> Result<SessionReply, BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send {
                command: command.to_string(),
                timeout,
                reply,
            })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Resize { cols, rows, reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Kills the process and waits for the actor to finish. Stopping an
    /// already ended session is a no-op.
    pub async fn stop(&self, reason: CloseReason) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Stop { reason, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    fn gone(&self) -> BridgeError {
        BridgeError::session(format!("session '{}' has ended", self.id))
    }
}

/// Per-session line in [`SessionStats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub age_seconds: u64,
    pub idle_seconds: u64,
    pub viewers: usize,
    pub buffered_chunks: usize,
    pub pid: Option<u32>,
}

/// Snapshot of every live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub platform: &'static str,
    pub sessions: Vec<SessionSummary>,
}

/// Owner of every session process.
pub struct SessionManager {
    config: SessionConfig,
    launcher: Arc<dyn ProcessLauncher>,
    registry: Arc<SessionRegistry>,
    matcher: Arc<dyn CompletionMatcher>,
    sessions: tokio::sync::Mutex<HashMap<String, SessionHandle>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Builds a manager with the completion heuristic from `config`.
    pub fn new(
        config: SessionConfig,
        launcher: Arc<dyn ProcessLauncher>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, BridgeError> {
        let matcher = Arc::new(MatcherChain::from_config(&config.completion)?);
        Ok(Self::with_matcher(config, launcher, registry, matcher))
    }

    pub fn with_matcher(
        config: SessionConfig,
        launcher: Arc<dyn ProcessLauncher>,
        registry: Arc<SessionRegistry>,
        matcher: Arc<dyn CompletionMatcher>,
    ) -> Self {
        Self {
            config,
            launcher,
            registry,
            matcher,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the live session for `session_id`, or spawns one.
    ///
    /// A missing id gets a fresh UUID. A closed session under the same id is
    /// replaced. When the cap is reached, idle sessions are reaped first.
    pub async fn open_or_reuse(
        &self,
        session_id: Option<&str>,
        work_dir: Option<&Path>,
        invocation: &CliInvocation,
    ) -> Result<SessionHandle, BridgeError> {
        let id = session_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

        if let Some(handle) = self.get(&id).await {
            debug!(session_id = %id, "Reusing live session");
            return Ok(handle);
        }

        if self.live_count().await >= self.config.max_sessions {
            let reaped = self.reap_idle(self.config.idle_timeout()).await;
            debug!(reaped = reaped.len(), "Session cap reached, reaped idle sessions");
        }

        // Held across the launch so two opens for one id cannot both spawn
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&id)
            && !handle.is_closed()
        {
            return Ok(handle.clone());
        }
        sessions.retain(|_, handle| !handle.is_closed());
        if sessions.len() >= self.config.max_sessions {
            warn!(max = self.config.max_sessions, "Session limit reached");
            return Err(BridgeError::SessionLimit(self.config.max_sessions));
        }

        let cwd = match work_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        let spec = LaunchSpec::new(invocation, cwd).with_size(self.config.cols, self.config.rows);
        let launched = self.launcher.launch(spec).await?;
        let handle = self.start_actor(&id, launched);

        self.registry.announce_created(&id);
        info!(session_id = %id, pid = ?handle.pid(), "Session started");

        sessions.insert(id, handle.clone());
        Ok(handle)
    }

    /// The live session for `session_id`, if any.
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    pub async fn is_live(&self, session_id: &str) -> bool {
        self.get(session_id).await.is_some()
    }

    pub async fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|handle| !handle.is_closed())
            .count()
    }

    /// Sends a command to an existing live session.
    pub async fn send(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<SessionReply, BridgeError> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        handle
            .send(command, timeout.unwrap_or_else(|| self.config.timeout()))
            .await
    }

    /// Stops a session and releases its viewers.
    pub async fn stop(&self, session_id: &str) -> Result<(), BridgeError> {
        self.stop_with(session_id, CloseReason::Stopped).await
    }

    async fn stop_with(&self, session_id: &str, reason: CloseReason) -> Result<(), BridgeError> {
        let handle = self.sessions.lock().await.remove(session_id);
        if let Some(handle) = &handle {
            handle.stop(reason).await;
        }
        // After the actor is gone, so no late output recreates the entry
        let registry_known = self.registry.close(session_id, reason);

        match handle {
            Some(_) => {
                info!(session_id, reason = ?reason, "Session stopped");
                Ok(())
            }
            None if registry_known => Ok(()),
            None => Err(BridgeError::SessionNotFound(session_id.to_string())),
        }
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let handle = self
            .get(session_id)
            .await
            .ok_or_else(|| BridgeError::SessionNotFound(session_id.to_string()))?;
        handle.resize(cols, rows).await
    }

    /// Stops sessions idle for longer than `max_idle`. Returns their ids.
    ///
    /// Registry entries left behind by sessions that already ended, and by
    /// viewers of ids that never started, are released once they have had
    /// no viewers for `max_idle`.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<String> {
        let idle: Vec<String> = {
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|_, handle| !handle.is_closed());
            sessions
                .iter()
                .filter(|(_, handle)| handle.idle() > max_idle)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &idle {
            info!(session_id = %id, "Reaping idle session");
            let _ = self.stop_with(id, CloseReason::Reaped).await;
        }

        let sessions = self.sessions.lock().await;
        self.registry.prune(max_idle, |id| {
            sessions.get(id).is_some_and(|handle| !handle.is_closed())
        });
        idle
    }

    /// Stops every session.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in ids {
            let _ = self.stop(&id).await;
        }
    }

    pub async fn stats(&self) -> SessionStats {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|handle| !handle.is_closed())
            .map(|handle| {
                let snapshot = self.registry.snapshot(handle.id());
                SessionSummary {
                    id: handle.id().to_string(),
                    state: handle.state(),
                    age_seconds: handle.age().as_secs(),
                    idle_seconds: handle.idle().as_secs(),
                    viewers: snapshot.as_ref().map_or(0, |s| s.viewers),
                    buffered_chunks: snapshot.as_ref().map_or(0, |s| s.buffered),
                    pid: handle.pid(),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        SessionStats {
            active_sessions: sessions.len(),
            max_sessions: self.config.max_sessions,
            platform: std::env::consts::OS,
            sessions,
        }
    }

    /// Periodically reaps idle sessions until aborted.
    pub fn spawn_janitor(self: Arc<Self>) -> JoinHandle<()> {
        let every = self.config.cleanup_interval();
        let max_idle = self.config.idle_timeout();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = self.reap_idle(max_idle).await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "Janitor reaped idle sessions");
                }
            }
        })
    }

    fn start_actor(&self, id: &str, launched: LaunchedProcess) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let pid = launched.process.process_id();

        let actor = SessionActor {
            id: id.to_string(),
            process: launched.process,
            registry: Arc::clone(&self.registry),
            matcher: Arc::clone(&self.matcher),
            state: state_tx,
            last_activity: Arc::clone(&last_activity),
            close_on_completion: self.config.close_on_completion,
            utf8_carry: Vec::new(),
            pending: None,
        };
        tokio::spawn(actor.run(launched.events, command_rx));

        SessionHandle {
            id: id.to_string(),
            pid,
            created_at: Instant::now(),
            last_activity,
            commands: command_tx,
            state: state_rx,
        }
    }
}

struct PendingSend {
    reply: oneshot::Sender<Result<SessionReply, BridgeError>>,
    deadline: tokio::time::Instant,
    timeout: Duration,
    stripper: AnsiStripper,
    text: String,
    scan: ScanState,
}

/// How the actor loop ended.
enum Ending {
    /// Explicit stop; the manager closes the registry entry.
    Stopped(Option<oneshot::Sender<()>>),
    /// The session ended on its own; viewers are notified here.
    Ended {
        reason: CloseReason,
        exit_code: Option<i32>,
        error: Option<BridgeError>,
    },
}

struct SessionActor {
    id: String,
    process: Box<dyn ManagedProcess>,
    registry: Arc<SessionRegistry>,
    matcher: Arc<dyn CompletionMatcher>,
    state: watch::Sender<SessionState>,
    last_activity: Arc<Mutex<Instant>>,
    close_on_completion: bool,
    utf8_carry: Vec<u8>,
    pending: Option<PendingSend>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ProcessEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let ending = loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            let timeout = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            // Output is drained before commands so a reply never jumps ahead
            // of chunks the process already emitted.
            tokio::select! {
                biased;

                () = timeout => {
                    let secs = self.pending.as_ref().map_or(0, |p| p.timeout.as_secs());
                    warn!(session_id = %self.id, timeout_secs = secs, "No completion before timeout, killing session");
                    let _ = self.process.terminate(true).await;
                    break Ending::Ended {
                        reason: CloseReason::TimedOut,
                        exit_code: None,
                        error: Some(BridgeError::timeout(format!(
                            "no completion within {secs}s"
                        ))),
                    };
                }

                event = events.recv() => match event {
                    Some(ProcessEvent::Output(bytes)) => {
                        if let Some(ending) = self.on_output(&bytes).await {
                            break ending;
                        }
                    }
                    Some(ProcessEvent::Eof) | None => break self.on_exit(None).await,
                    Some(ProcessEvent::ReadError(e)) => break self.on_exit(Some(e)).await,
                },

                command = commands.recv() => match command {
                    Some(SessionCommand::Send { command, timeout, reply }) => {
                        if let Some(ending) = self.on_send(command, timeout, reply) {
                            break ending;
                        }
                    }
                    Some(SessionCommand::Resize { cols, rows, reply }) => {
                        let result = self
                            .process
                            .resize(cols, rows)
                            .map_err(|e| BridgeError::session(format!("resize failed: {e}")));
                        let _ = reply.send(result);
                    }
                    Some(SessionCommand::Stop { reason, reply }) => {
                        debug!(session_id = %self.id, ?reason, "Stopping session process");
                        let _ = self.process.terminate(false).await;
                        break Ending::Stopped(Some(reply));
                    }
                    None => {
                        let _ = self.process.terminate(true).await;
                        break Ending::Stopped(None);
                    }
                },
            }
        };

        self.finish(ending);
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn on_send(
        &mut self,
        command: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<SessionReply, BridgeError>>,
    ) -> Option<Ending> {
        if self.pending.is_some() {
            let _ = reply.send(Err(BridgeError::SessionBusy(self.id.clone())));
            return None;
        }

        debug!(session_id = %self.id, command_len = command.len(), "Writing command to session");
        let mut line = command.into_bytes();
        line.push(b'\n');
        if let Err(e) = self.process.write(&line) {
            let message = format!("write failed: {e}");
            let _ = reply.send(Err(BridgeError::session(message.clone())));
            return Some(Ending::Ended {
                reason: CloseReason::Failed,
                exit_code: None,
                error: Some(BridgeError::session(message)),
            });
        }

        self.touch();
        self.set_state(SessionState::Active);
        self.pending = Some(PendingSend {
            reply,
            deadline: tokio::time::Instant::now() + timeout,
            timeout,
            stripper: AnsiStripper::new(),
            text: String::new(),
            scan: ScanState::default(),
        });
        None
    }

    async fn on_output(&mut self, bytes: &[u8]) -> Option<Ending> {
        self.touch();
        if *self.state.borrow() == SessionState::Starting {
            self.set_state(SessionState::Active);
        }

        let chunk = decode_utf8(&mut self.utf8_carry, bytes);
        if !chunk.is_empty() {
            self.registry.broadcast(&self.id, &chunk);
        }

        let pending = self.pending.as_mut()?;
        let plain = pending.stripper.push(bytes);
        pending.text.push_str(&plain);
        if !self.matcher.is_complete_grown(&pending.text, &mut pending.scan) {
            return None;
        }

        self.set_state(SessionState::Completing);
        if let Some(pending) = self.pending.take() {
            debug!(session_id = %self.id, output_len = pending.text.len(), "Completion detected");
            let _ = pending.reply.send(Ok(SessionReply {
                output: pending.text,
                exit_code: None,
            }));
        }

        if self.close_on_completion {
            let _ = self.process.terminate(true).await;
            return Some(Ending::Ended {
                reason: CloseReason::Completed,
                exit_code: None,
                error: None,
            });
        }
        self.set_state(SessionState::Active);
        None
    }

    async fn on_exit(&mut self, read_error: Option<String>) -> Ending {
        let exit_code = self.wait_for_exit().await;
        debug!(session_id = %self.id, ?exit_code, ?read_error, "Session process ended");

        let failure = match (exit_code, &read_error) {
            (Some(0), _) => None,
            (Some(code), _) => Some(BridgeError::ExitStatus {
                code: Some(code),
                stderr: String::new(),
            }),
            (None, Some(e)) => Some(BridgeError::session(format!("output stream failed: {e}"))),
            (None, None) => None,
        };

        if let Some(pending) = self.pending.take() {
            let output = pending.text;
            let result = match &failure {
                None => Ok(SessionReply { output, exit_code }),
                Some(BridgeError::ExitStatus { code, .. }) => Err(BridgeError::ExitStatus {
                    code: *code,
                    stderr: tail(&output, 2000),
                }),
                Some(err) => Err(BridgeError::session(err.to_string())),
            };
            let _ = pending.reply.send(result);
        }

        let reason = if exit_code.is_some() || read_error.is_none() {
            CloseReason::Exited
        } else {
            CloseReason::Failed
        };
        Ending::Ended {
            reason,
            exit_code,
            error: failure,
        }
    }

    async fn wait_for_exit(&mut self) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            match self.process.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => {
                    debug!(session_id = %self.id, error = %e, "try_wait failed");
                    return None;
                }
            }
        }
        None
    }

    fn finish(mut self, ending: Ending) {
        self.set_state(SessionState::Closed);

        match ending {
            Ending::Stopped(reply) => {
                if let Some(pending) = self.pending.take() {
                    let _ = pending
                        .reply
                        .send(Err(BridgeError::session(format!("session '{}' was stopped", self.id))));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Ending::Ended {
                reason,
                exit_code,
                error,
            } => {
                if let Some(pending) = self.pending.take() {
                    let err = match &error {
                        Some(BridgeError::Classified { kind, message }) => {
                            BridgeError::classified(*kind, message.clone())
                        }
                        Some(other) => BridgeError::session(other.to_string()),
                        None => BridgeError::session(format!("session '{}' ended", self.id)),
                    };
                    let _ = pending.reply.send(Err(err));
                }
                info!(session_id = %self.id, reason = ?reason, ?exit_code, "Session ended");
                self.registry.mark_ended(
                    &self.id,
                    reason,
                    exit_code,
                    error.as_ref().map(BridgeError::payload),
                );
            }
        }
    }
}

/// Decodes as much of `carry + bytes` as forms complete UTF-8, keeping a
/// trailing partial sequence for the next chunk.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    match std::str::from_utf8(carry) {
        Ok(text) => {
            let text = text.to_string();
            carry.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
            carry.drain(..valid);
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            text
        }
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_carries_split_sequences() {
        let mut carry = Vec::new();
        let bytes = "héllo ❯".as_bytes();
        // Split inside the three-byte prompt glyph
        let split = bytes.len() - 1;
        assert_eq!(decode_utf8(&mut carry, &bytes[..split]), "héllo ");
        assert_eq!(carry.len(), 2);
        assert_eq!(decode_utf8(&mut carry, &bytes[split..]), "❯");
        assert!(carry.is_empty());
    }

    #[test]
    fn test_decode_utf8_replaces_invalid_bytes() {
        let mut carry = Vec::new();
        let text = decode_utf8(&mut carry, b"ok \xff done");
        assert!(text.starts_with("ok "));
        assert!(text.ends_with(" done"));
        assert!(carry.is_empty());
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
