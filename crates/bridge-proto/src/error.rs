//! Error taxonomy shared by every bridge component.
//!
//! Failures are sorted into an [`ErrorKind`] with a fixed severity and a fixed
//! retryability flag. [`BridgeError`] is what components return; callers
//! across the external interface only ever see its [`ErrorPayload`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Convenience alias used across the bridge crates.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Classification of a recoverable or terminal fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Socket,
    Backend,
    Timeout,
    Session,
    Protocol,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Connection,
        ErrorKind::Socket,
        ErrorKind::Backend,
        ErrorKind::Timeout,
        ErrorKind::Session,
        ErrorKind::Protocol,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Socket => "socket",
            ErrorKind::Backend => "backend",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Session => "session",
            ErrorKind::Protocol => "protocol",
        }
    }

    /// Transient faults are retryable. Session and protocol faults mean the
    /// conversational state is broken and need an explicit reset.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Socket | ErrorKind::Backend | ErrorKind::Timeout
        )
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::Connection | ErrorKind::Backend | ErrorKind::Session => Severity::High,
            ErrorKind::Socket | ErrorKind::Timeout => Severity::Medium,
            ErrorKind::Protocol => Severity::Critical,
        }
    }

    /// Topic name of the retry signal for this kind, e.g. `retry:timeout`.
    ///
    /// Returns `None` for kinds that are never retried.
    pub fn retry_topic(self) -> Option<&'static str> {
        match self {
            ErrorKind::Connection => Some("retry:connection"),
            ErrorKind::Socket => Some("retry:socket"),
            ErrorKind::Backend => Some("retry:backend"),
            ErrorKind::Timeout => Some("retry:timeout"),
            ErrorKind::Session | ErrorKind::Protocol => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly a fault should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Structured error object handed across the external interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Errors produced by bridge components.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No candidate binary resolved and answered the version probe.
    #[error("no usable CLI binary found ({candidates} candidates checked)")]
    NotFound { candidates: usize },

    /// The OS refused to start the process.
    #[error("failed to start CLI process: {0}")]
    SpawnFailure(String),

    /// The rate limiter rejected the request.
    #[error("too many requests, retry in {retry_after_secs}s")]
    Throttled {
        retry_after_secs: u64,
        limit: u32,
        window_ms: u64,
    },

    /// A fault that the recovery manager knows how to classify.
    #[error("{kind} error: {message}")]
    Classified { kind: ErrorKind, message: String },

    /// The process ran to completion with a non-zero exit code.
    #[error("CLI exited with {}: {stderr}", exit_label(.code))]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("session '{0}' already has a command in flight")]
    SessionBusy(String),

    #[error("maximum number of sessions ({0}) reached")]
    SessionLimit(usize),

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "no exit code".to_string(),
    }
}

impl BridgeError {
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        BridgeError::Classified {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::classified(ErrorKind::Timeout, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::classified(ErrorKind::Backend, message)
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::classified(ErrorKind::Session, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::classified(ErrorKind::Protocol, message)
    }

    /// The recovery classification, if this error has one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            BridgeError::Classified { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the recovery manager may schedule a retry for this error.
    pub fn is_retryable(&self) -> bool {
        self.error_kind().is_some_and(ErrorKind::is_retryable)
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BridgeError::NotFound { .. } => "not_found",
            BridgeError::SpawnFailure(_) => "spawn_failure",
            BridgeError::Throttled { .. } => "throttled",
            BridgeError::Classified { kind, .. } => kind.as_str(),
            BridgeError::ExitStatus { .. } => "exit_status",
            BridgeError::SessionBusy(_) => "session_busy",
            BridgeError::SessionLimit(_) => "session_limit",
            BridgeError::SessionNotFound(_) => "session_not_found",
            BridgeError::Io(_) => "io",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.kind_name(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_per_kind() {
        let retryable: Vec<_> = ErrorKind::ALL
            .into_iter()
            .filter(|k| k.is_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![
                ErrorKind::Connection,
                ErrorKind::Socket,
                ErrorKind::Backend,
                ErrorKind::Timeout
            ]
        );
        assert!(ErrorKind::Session.retry_topic().is_none());
        assert_eq!(ErrorKind::Timeout.retry_topic(), Some("retry:timeout"));
    }

    #[test]
    fn test_protocol_is_critical() {
        assert_eq!(ErrorKind::Protocol.severity(), Severity::Critical);
        assert!(Severity::Critical > Severity::High);
    }

    #[test]
    fn test_payload_carries_kind_and_message() {
        let err = BridgeError::ExitStatus {
            code: Some(1),
            stderr: "permission denied".to_string(),
        };
        let payload = err.payload();
        assert_eq!(payload.kind, "exit_status");
        assert!(payload.message.contains("permission denied"));
        assert!(payload.message.contains("code 1"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = BridgeError::timeout("no completion marker within 300s");
        assert_eq!(err.error_kind(), Some(ErrorKind::Timeout));
        assert!(err.is_retryable());
        assert_eq!(err.kind_name(), "timeout");
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ErrorKind::Backend).unwrap();
        assert_eq!(json, "\"backend\"");
    }
}
