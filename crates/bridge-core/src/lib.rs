//! # bridge-core
//!
//! Core state for Coder Bridge.
//!
//! This crate provides:
//! - Configuration loading and validation
//! - The sliding-window rate limiter
//! - The error recovery manager and its durable error journal
//! - The session registry that multiplexes output to viewers

mod config;
mod error_journal;
mod rate_limiter;
mod recovery;
mod registry;

pub use config::{
    BinaryConfig, BridgeConfig, CompletionConfig, ConfigError, ConfigWarning, DispatchConfig,
    RateLimitConfig, RateLimitPolicy, RecoveryConfig, SessionConfig, BINARY_ENV_VAR,
};
pub use error_journal::{ErrorJournal, JournalEntry};
pub use rate_limiter::{
    EndpointClass, RateLimitDecision, RateLimitKey, RateLimitRejection, RateLimiter,
};
pub use recovery::{
    ErrorDetails, ErrorRecord, RecoveryAction, RecoveryManager, RecoveryState, RetrySignal,
    RetrySubscription,
};
pub use registry::{SessionRegistry, ViewerChannel, ViewerClosed, ViewerId, ViewerSnapshot};
