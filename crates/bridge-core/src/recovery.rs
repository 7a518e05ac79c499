//! Error classification, retry scheduling and exponential backoff.
//!
//! Every error kind is its own stream with its own retry counter:
//!
//! ```text
//! Idle -> ErrorDetected -> (Retrying)* -> Recovered | Fatal
//! ```
//!
//! A retryable error under the retry cap schedules a [`RetrySignal`] after
//! `base_delay * 2^retry_count`. Components waiting to re-attempt an
//! operation hold a [`RetrySubscription`] for that kind.

use crate::config::RecoveryConfig;
use crate::error_journal::ErrorJournal;
use bridge_proto::{BridgeEvent, ErrorKind, Severity};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SIGNAL_CAPACITY: usize = 64;

/// Context attached to a reported error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// One classified failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Retries already spent on this kind when the error arrived.
    pub retry_count: u32,
    pub details: ErrorDetails,
}

/// Where an error stream currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    ErrorDetected,
    Retrying { attempt: u32 },
    Recovered,
    Fatal,
}

/// What the caller should do about an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// Wait for the retry signal, then re-attempt. `attempt` is 1-based.
    Retry { attempt: u32, delay: Duration },
    /// Give up and surface the error.
    Fatal { record: ErrorRecord },
}

/// Emitted once a scheduled retry delay has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySignal {
    pub kind: ErrorKind,
    pub attempt: u32,
    pub delay: Duration,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

impl RetrySignal {
    /// The viewer-facing form (`retry:<kind>` topic).
    pub fn to_event(&self) -> BridgeEvent {
        BridgeEvent::Retry {
            kind: self.kind,
            attempt: self.attempt,
            delay_ms: self.delay.as_millis() as u64,
            session_id: self.session_id.clone(),
        }
    }
}

/// Receiver for the retry signals of one error kind.
pub struct RetrySubscription {
    kind: ErrorKind,
    rx: broadcast::Receiver<RetrySignal>,
}

impl RetrySubscription {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Next signal for this kind. `None` once the manager is dropped.
    pub async fn recv(&mut self) -> Option<RetrySignal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(kind = %self.kind, skipped, "Retry subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next signal scheduled for the given request.
    pub async fn recv_for(&mut self, request_id: &str) -> Option<RetrySignal> {
        loop {
            let signal = self.recv().await?;
            if signal.request_id.as_deref() == Some(request_id) {
                return Some(signal);
            }
        }
    }
}

#[derive(Debug)]
struct ErrorStream {
    retry_count: u32,
    state: RecoveryState,
}

impl Default for ErrorStream {
    fn default() -> Self {
        Self {
            retry_count: 0,
            state: RecoveryState::Idle,
        }
    }
}

/// Classifies failures and drives per-kind retry state.
pub struct RecoveryManager {
    config: RecoveryConfig,
    streams: Mutex<HashMap<ErrorKind, ErrorStream>>,
    signals: HashMap<ErrorKind, broadcast::Sender<RetrySignal>>,
    history: Mutex<VecDeque<ErrorRecord>>,
    journal: Option<ErrorJournal>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .field("journal", &self.journal.is_some())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Creates a manager, opening the error journal named in the config.
    ///
    /// A journal that cannot be opened is logged and disabled.
    pub fn new(config: RecoveryConfig) -> Self {
        let journal = config
            .error_log
            .as_deref()
            .and_then(|path| match ErrorJournal::open(path) {
                Ok(journal) => Some(journal),
                Err(e) => {
                    warn!(path, error = %e, "Error journal unavailable, critical errors will only be logged");
                    None
                }
            });
        Self::with_journal(config, journal)
    }

    pub fn with_journal(config: RecoveryConfig, journal: Option<ErrorJournal>) -> Self {
        let signals = ErrorKind::ALL
            .into_iter()
            .map(|kind| (kind, broadcast::channel(SIGNAL_CAPACITY).0))
            .collect();

        Self {
            config,
            streams: Mutex::new(HashMap::new()),
            signals,
            history: Mutex::new(VecDeque::new()),
            journal,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Subscribes to retry signals for one kind.
    ///
    /// Subscribe before reporting the error so the signal cannot be missed.
    pub fn subscribe(&self, kind: ErrorKind) -> RetrySubscription {
        let rx = match self.signals.get(&kind) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        RetrySubscription { kind, rx }
    }

    /// Reports an error. Returns true when a retry was scheduled.
    pub fn handle(&self, kind: ErrorKind, message: &str, details: ErrorDetails) -> bool {
        matches!(
            self.assess(kind, message, details),
            RecoveryAction::Retry { .. }
        )
    }

    /// Reports an error and returns the full decision.
    pub fn assess(&self, kind: ErrorKind, message: &str, details: ErrorDetails) -> RecoveryAction {
        let (record, action) = {
            let mut streams = self
                .streams
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let stream = streams.entry(kind).or_default();
            stream.state = RecoveryState::ErrorDetected;

            let record = ErrorRecord {
                kind,
                severity: kind.severity(),
                retryable: kind.is_retryable(),
                message: message.to_string(),
                timestamp: Utc::now(),
                retry_count: stream.retry_count,
                details,
            };

            let action = if record.retryable && stream.retry_count < self.config.max_retries {
                let delay = self.config.delay_for(stream.retry_count);
                stream.retry_count += 1;
                stream.state = RecoveryState::Retrying {
                    attempt: stream.retry_count,
                };
                RecoveryAction::Retry {
                    attempt: stream.retry_count,
                    delay,
                }
            } else {
                stream.state = RecoveryState::Fatal;
                RecoveryAction::Fatal {
                    record: record.clone(),
                }
            };
            (record, action)
        };

        self.log(&record, &action);
        self.remember(record.clone());

        if record.severity == Severity::Critical {
            self.journal(&record);
        }

        if let RecoveryAction::Retry { attempt, delay } = action {
            self.schedule(RetrySignal {
                kind,
                attempt,
                delay,
                request_id: record.details.request_id.clone(),
                session_id: record.details.session_id.clone(),
            });
        }

        action
    }

    /// A successful execution resets every stream that saw errors.
    pub fn record_success(&self) {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (kind, stream) in streams.iter_mut() {
            if stream.retry_count > 0 || stream.state != RecoveryState::Idle {
                if stream.retry_count > 0 {
                    info!(kind = %kind, retries = stream.retry_count, "Recovered after retry");
                }
                stream.retry_count = 0;
                stream.state = RecoveryState::Recovered;
            }
        }
    }

    /// Explicitly clears a stream, e.g. after a session was recreated.
    pub fn reset(&self, kind: ErrorKind) {
        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        streams.remove(&kind);
    }

    pub fn state(&self, kind: ErrorKind) -> RecoveryState {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&kind)
            .map_or(RecoveryState::Idle, |s| s.state)
    }

    pub fn retry_count(&self, kind: ErrorKind) -> u32 {
        self.streams
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&kind)
            .map_or(0, |s| s.retry_count)
    }

    /// Most recent error records, oldest first.
    pub fn history(&self) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn remember(&self, record: ErrorRecord) {
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history.push_back(record);
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    fn journal(&self, record: &ErrorRecord) {
        if let Some(journal) = &self.journal
            && let Err(e) = journal.record("error.critical", record)
        {
            warn!(error = %e, "Failed to write error journal");
        }
    }

    fn log(&self, record: &ErrorRecord, action: &RecoveryAction) {
        match action {
            RecoveryAction::Retry { attempt, delay } => warn!(
                kind = %record.kind,
                severity = %record.severity,
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "{}; retrying",
                record.message
            ),
            RecoveryAction::Fatal { .. } if record.severity >= Severity::High => error!(
                kind = %record.kind,
                severity = %record.severity,
                retries = record.retry_count,
                "{}",
                record.message
            ),
            RecoveryAction::Fatal { .. } => warn!(
                kind = %record.kind,
                severity = %record.severity,
                retries = record.retry_count,
                "{}",
                record.message
            ),
        }
    }

    fn schedule(&self, signal: RetrySignal) {
        let Some(tx) = self.signals.get(&signal.kind).cloned() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(signal.delay).await;
                    // No receivers just means nobody is waiting for this kind
                    let _ = tx.send(signal);
                });
            }
            Err(_) => {
                debug!(kind = %signal.kind, "No runtime, emitting retry signal immediately");
                let _ = tx.send(signal);
            }
        }
    }
}
