//! Configuration types for Coder Bridge.
//!
//! Everything has a serde default so an empty (or missing) `coder-bridge.yml`
//! yields a working configuration. Environment overrides are applied after
//! loading, CLI flags after that.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable holding an explicit CLI binary path.
///
/// When set, it replaces `binary.path` and is probed before `PATH`.
pub const BINARY_ENV_VAR: &str = "CODER_BRIDGE_BINARY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Where and how to find the CLI binary.
    #[serde(default)]
    pub binary: BinaryConfig,

    /// Interactive session settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Mode selection settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-endpoint-class request throttles.
    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    /// Retry and backoff settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Suppress all warnings (for CI environments).
    #[serde(default, rename = "_suppress_warnings")]
    pub suppress_warnings: bool,
}

impl BridgeConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config = Self::from_yaml(&content)?;
        debug!(
            binary_names = ?config.binary.names,
            search_paths = config.binary.search_paths.len(),
            session_timeout_secs = config.session.timeout_secs,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parses configuration from YAML text. Empty text yields defaults.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_binary_override(std::env::var(BINARY_ENV_VAR).ok());
    }

    /// Sets the explicit binary path, which the locator probes first.
    pub fn apply_binary_override(&mut self, path: Option<String>) {
        let Some(path) = path.filter(|p| !p.trim().is_empty()) else {
            return;
        };
        debug!(path = %path, env = BINARY_ENV_VAR, "Applying binary override");
        self.binary.path = Some(path);
    }

    /// Validates the configuration and returns warnings.
    ///
    /// Hard errors (unusable values) are returned as `Err`; questionable but
    /// workable values become warnings for the caller to display.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if let Err(e) = regex::Regex::new(&self.session.completion.prompt_pattern) {
            return Err(ConfigError::InvalidPattern {
                field: "session.completion.prompt_pattern".to_string(),
                message: e.to_string(),
            });
        }

        if self.session.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.buffer_size".to_string(),
                message: "output buffer must hold at least one chunk".to_string(),
            });
        }

        for (class, policy) in [
            ("ai", &self.rate_limits.ai),
            ("general", &self.rate_limits.general),
            ("session", &self.rate_limits.session),
        ] {
            if policy.window_ms == 0 || policy.max_requests == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("rate_limits.{class}"),
                    message: "window_ms and max_requests must both be positive".to_string(),
                });
            }
        }

        let mut warnings = Vec::new();
        if self.suppress_warnings {
            return Ok(warnings);
        }

        if self.session.completion.markers.is_empty() {
            warnings.push(ConfigWarning::InvalidValue {
                field: "session.completion.markers".to_string(),
                message: "No completion markers; only the hard timeout or process exit will end a command"
                    .to_string(),
            });
        } else if self.session.completion.required_markers == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "session.completion.required_markers".to_string(),
                message: "Zero required markers: any prompt-like line completes a command".to_string(),
            });
        }

        if self.session.timeout_secs == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "session.timeout_secs".to_string(),
                message: format!(
                    "Timeout of 0 is not allowed, using {}s",
                    default_session_timeout()
                ),
            });
        }

        if self.binary.names.is_empty() && self.binary.search_paths.is_empty() {
            warnings.push(ConfigWarning::InvalidValue {
                field: "binary.names".to_string(),
                message: "No binary names or search paths; only well-known install locations are checked"
                    .to_string(),
            });
        }

        if self.recovery.max_retries > 10 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "recovery.max_retries".to_string(),
                message: format!(
                    "{} retries means a final backoff of {}ms",
                    self.recovery.max_retries,
                    self.recovery.delay_for(self.recovery.max_retries - 1).as_millis()
                ),
            });
        }

        Ok(warnings)
    }
}

/// Binary discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryConfig {
    /// Explicit executable, probed before anything else.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Executable names resolved against `PATH`, in order.
    #[serde(default = "default_binary_names")]
    pub names: Vec<String>,

    /// Explicit paths tried after `PATH`, before well-known install locations.
    #[serde(default)]
    pub search_paths: Vec<String>,

    /// How long a `--version` or `--help` probe may take.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Extra arguments passed on every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_binary_names() -> Vec<String> {
    vec!["claude".to_string()]
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            path: None,
            names: default_binary_names(),
            search_paths: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
            extra_args: Vec::new(),
        }
    }
}

impl BinaryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Interactive session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard timeout per command, in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Output chunks retained per session for late joiners.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Concurrent session cap.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Sessions idle for longer than this are reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle reaper runs.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// End the session after the first completed command.
    #[serde(default)]
    pub close_on_completion: bool,

    /// Terminal width.
    #[serde(default = "default_cols")]
    pub cols: u16,

    /// Terminal height.
    #[serde(default = "default_rows")]
    pub rows: u16,

    /// Completion heuristic tuning.
    #[serde(default)]
    pub completion: CompletionConfig,
}

fn default_session_timeout() -> u64 {
    300 // 5 minutes
}

fn default_buffer_size() -> usize {
    1000
}

fn default_max_sessions() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            buffer_size: default_buffer_size(),
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            close_on_completion: false,
            cols: default_cols(),
            rows: default_rows(),
            completion: CompletionConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Hard per-command timeout. Zero falls back to the default.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_secs == 0 {
            default_session_timeout()
        } else {
            self.timeout_secs
        };
        Duration::from_secs(secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Completion heuristic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Substrings that indicate the tool finished an answer.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,

    /// How many marker occurrences must be seen before the prompt counts.
    #[serde(default = "default_required_markers")]
    pub required_markers: usize,

    /// Regex matched against the text after the last required marker.
    #[serde(default = "default_prompt_pattern")]
    pub prompt_pattern: String,
}

fn default_markers() -> Vec<String> {
    vec!["</result>".to_string(), "completed".to_string()]
}

fn default_required_markers() -> usize {
    1
}

fn default_prompt_pattern() -> String {
    // A fresh line ending in a prompt character, at the very end of output.
    r"\r?\n[^\n]*[>$#❯][ \t]*$".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            markers: default_markers(),
            required_markers: default_required_markers(),
            prompt_pattern: default_prompt_pattern(),
        }
    }
}

/// Mode-selection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Commands longer than this many characters go interactive.
    #[serde(default = "default_interactive_threshold")]
    pub interactive_threshold: usize,
}

fn default_interactive_threshold() -> usize {
    200
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interactive_threshold: default_interactive_threshold(),
        }
    }
}

/// A `(windowMs, maxRequests)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl RateLimitPolicy {
    pub const fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }
}

/// Per-endpoint-class throttles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// AI invocation endpoints: narrow and strict.
    #[serde(default = "default_ai_policy")]
    pub ai: RateLimitPolicy,

    /// General reads: looser.
    #[serde(default = "default_general_policy")]
    pub general: RateLimitPolicy,

    /// Session control (attach, stop, resize).
    #[serde(default = "default_session_policy")]
    pub session: RateLimitPolicy,

    /// How often idle rate-limit entries are swept.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_ai_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(60_000, 10)
}

fn default_general_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(60_000, 100)
}

fn default_session_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(60_000, 30)
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ai: default_ai_policy(),
            general: default_general_policy(),
            session: default_session_policy(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retries allowed per error kind before the failure turns fatal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// JSONL file receiving critical errors. `None` disables the journal.
    #[serde(default = "default_error_log")]
    pub error_log: Option<String>,

    /// Error records kept in memory.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

#[allow(clippy::unnecessary_wraps)] // serde default must match the field type
fn default_error_log() -> Option<String> {
    Some(".coder-bridge/errors.jsonl".to_string())
}

fn default_history_size() -> usize {
    100
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            error_log: default_error_log(),
            history_size: default_history_size(),
        }
    }
}

impl RecoveryConfig {
    /// Backoff before retry number `retry_count` (zero-based).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1_u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone)]
pub enum ConfigWarning {
    /// Field has a questionable value.
    InvalidValue { field: String, message: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { field, message } => {
                write!(f, "Warning [{}]: {}", field, message)
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid pattern in '{field}': {message}")]
    InvalidPattern { field: String, message: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}
