//! Request/response types for the command-execution call.
//!
//! Field names serialize in camelCase to match what the IDE layer sends and
//! expects: `{ command, workingDirectory?, sessionId?, timeout?, outputFormat? }`
//! in, `{ type, command, result, duration, success, sessionId, error? }` out.

use crate::error::{BridgeError, ErrorPayload};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which execution path a request should take.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedMode {
    /// Let the dispatcher decide from the command shape.
    #[default]
    Auto,
    Headless,
    Interactive,
}

/// The path a request actually took, reported as the result `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Headless invocation with plain-text output.
    Simple,
    /// Headless invocation with structured (JSON) output.
    Headless,
    /// Interactive pseudo-terminal session.
    Complex,
}

/// A single command-execution request. Ephemeral, created per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mode: RequestedMode,
    /// Timeout override in milliseconds.
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub output_format: Option<String>,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: new_request_id(),
            command: command.into(),
            working_directory: None,
            session_id: None,
            mode: RequestedMode::Auto,
            timeout_ms: None,
            output_format: None,
        }
    }

    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: RequestedMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// True when the caller explicitly asked for plain text output.
    pub fn wants_text(&self) -> bool {
        self.output_format
            .as_deref()
            .is_some_and(|f| f.eq_ignore_ascii_case("text"))
    }
}

/// Parsed command output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputPayload {
    /// One JSON value per stdout line that parsed as an object.
    Structured(Vec<serde_json::Value>),
    /// Raw text when nothing parsed as JSON.
    Text(String),
}

impl OutputPayload {
    /// Parses output line by line, keeping every line that starts with `{`
    /// and parses as JSON. Falls back to the raw text if none does.
    pub fn parse(raw: &str) -> Self {
        let values: Vec<serde_json::Value> = raw
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        if values.is_empty() {
            OutputPayload::Text(raw.to_string())
        } else {
            OutputPayload::Structured(values)
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, OutputPayload::Structured(_))
    }

    /// Text view of the payload (JSON lines re-joined for structured output).
    pub fn as_text(&self) -> String {
        match self {
            OutputPayload::Text(text) => text.clone(),
            OutputPayload::Structured(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Result of one execution request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(rename = "type")]
    pub mode: ExecutionMode,
    pub command: String,
    pub result: OutputPayload,
    /// Wall-clock duration in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub success: bool,
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ExecutionResult {
    pub fn succeeded(
        mode: ExecutionMode,
        command: impl Into<String>,
        result: OutputPayload,
        duration: Duration,
        session_id: Option<String>,
    ) -> Self {
        Self {
            mode,
            command: command.into(),
            result,
            duration_ms: duration.as_millis() as u64,
            success: true,
            session_id,
            error: None,
        }
    }

    /// Builds a failed result. `output` is whatever the process produced
    /// before failing (may be empty).
    pub fn failed(
        mode: ExecutionMode,
        command: impl Into<String>,
        output: OutputPayload,
        duration: Duration,
        session_id: Option<String>,
        error: &BridgeError,
    ) -> Self {
        Self {
            mode,
            command: command.into(),
            result: output,
            duration_ms: duration.as_millis() as u64,
            success: false,
            session_id,
            error: Some(error.payload()),
        }
    }
}

/// Which pipe an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An incremental piece of process output, delivered to progress listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}
