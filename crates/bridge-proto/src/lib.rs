//! # bridge-proto
//!
//! Shared types, error definitions, and events for Coder Bridge.
//!
//! This crate provides the foundational abstractions used across all bridge
//! crates, including:
//! - Execution requests and results exchanged with the IDE layer
//! - Binary discovery results
//! - Viewer-facing streaming events
//! - The error taxonomy (kinds, severities, retryability)

mod binary;
mod error;
mod event;
mod execution;
mod session;

pub use binary::{BinaryInfo, Capabilities};
pub use error::{BridgeError, ErrorKind, ErrorPayload, Result, Severity};
pub use event::{BridgeEvent, CloseReason};
pub use execution::{
    ExecutionMode, ExecutionRequest, ExecutionResult, OutputChunk, OutputPayload, OutputStream,
    RequestedMode,
};
pub use session::SessionState;
