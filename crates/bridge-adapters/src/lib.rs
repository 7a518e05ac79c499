//! # bridge-adapters
//!
//! Process-facing components for Coder Bridge.
//!
//! This crate provides:
//! - Binary location and capability probing
//! - CLI invocation building and one-shot headless execution
//! - PTY-backed managed processes and the interactive session manager
//! - The completion heuristic for interactive output
//! - Request dispatch and the [`Bridge`] facade tying everything together
//! - A scripted launcher for deterministic tests ([`testing`])

mod backend;
mod bridge;
mod completion;
mod dispatcher;
mod headless;
mod locator;
mod process;
mod session;

pub mod testing;

pub use backend::{CliBackend, CliInvocation, OutputFormat};
pub use bridge::{Bridge, MaintenanceTasks};
pub use completion::{
    AnsiStripper, CompletionMatcher, MarkerPromptMatcher, MatcherChain, ScanState, strip_ansi,
};
pub use dispatcher::{Dispatcher, Route, select_route};
pub use headless::HeadlessExecutor;
pub use locator::{BinaryLocator, NotFoundError, WELL_KNOWN_LOCATIONS};
pub use process::{
    LaunchSpec, LaunchedProcess, ManagedProcess, ProcessEvent, ProcessLauncher, PtyLauncher,
};
pub use session::{SessionHandle, SessionManager, SessionReply, SessionStats, SessionSummary};
