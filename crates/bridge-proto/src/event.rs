//! Streaming events delivered to viewers.
//!
//! Every viewer channel receives the same ordered sequence of events for a
//! session: a creation notice, one data event per output chunk, and a closed
//! notice. Retry signals are delivered to whoever subscribed to that kind.

use crate::error::{ErrorKind, ErrorPayload};
use serde::{Deserialize, Serialize};

/// Why a session stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit stop request.
    Stopped,
    /// Completion heuristic fired and the session was configured to end.
    Completed,
    /// The process exited on its own.
    Exited,
    /// The hard timeout elapsed and the process was killed.
    TimedOut,
    /// Reaped after sitting idle.
    Reaped,
    /// The process could not be read or written any more.
    Failed,
}

/// An event emitted toward viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BridgeEvent {
    /// A new session was spawned.
    #[serde(rename = "session.created", rename_all = "camelCase")]
    SessionCreated { session_id: String },

    /// One chunk of session output, in emission order.
    #[serde(rename = "session.data", rename_all = "camelCase")]
    Data { session_id: String, data: String },

    /// The session ended.
    #[serde(rename = "session.closed", rename_all = "camelCase")]
    Closed {
        session_id: String,
        reason: CloseReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },

    /// A retry was scheduled for a failed operation.
    #[serde(rename = "retry", rename_all = "camelCase")]
    Retry {
        kind: ErrorKind,
        attempt: u32,
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl BridgeEvent {
    pub fn data(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        BridgeEvent::Data {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    pub fn closed(session_id: impl Into<String>, reason: CloseReason) -> Self {
        BridgeEvent::Closed {
            session_id: session_id.into(),
            reason,
            exit_code: None,
            error: None,
        }
    }

    /// Routing topic, e.g. `session.data` or `retry:backend`.
    pub fn topic(&self) -> &'static str {
        match self {
            BridgeEvent::SessionCreated { .. } => "session.created",
            BridgeEvent::Data { .. } => "session.data",
            BridgeEvent::Closed { .. } => "session.closed",
            BridgeEvent::Retry { kind, .. } => kind.retry_topic().unwrap_or("retry"),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::SessionCreated { session_id }
            | BridgeEvent::Data { session_id, .. }
            | BridgeEvent::Closed { session_id, .. } => Some(session_id),
            BridgeEvent::Retry { session_id, .. } => session_id.as_deref(),
        }
    }
}
