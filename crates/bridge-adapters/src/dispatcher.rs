//! Execution dispatch: throttle, route, execute, retry.
//!
//! Requests pass the rate limiter first; a rejection fails fast without
//! spawning anything. Routing then picks the headless or interactive path,
//! and retryable failures go through the recovery manager, which decides
//! whether and when to re-attempt.

use crate::backend::{CliBackend, OutputFormat};
use crate::headless::HeadlessExecutor;
use crate::locator::BinaryLocator;
use crate::session::SessionManager;
use bridge_core::{
    BridgeConfig, EndpointClass, ErrorDetails, RateLimitKey, RateLimiter, RecoveryAction,
    RecoveryManager, SessionRegistry,
};
use bridge_proto::{
    BridgeError, ExecutionMode, ExecutionRequest, ExecutionResult, OutputChunk, OutputPayload,
    RequestedMode,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Extra wait beyond the scheduled delay before giving up on a retry signal.
const RETRY_SIGNAL_SLACK: Duration = Duration::from_secs(5);

/// The execution path chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Headless,
    Interactive,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Headless => f.write_str("headless"),
            Route::Interactive => f.write_str("interactive"),
        }
    }
}

/// Picks the execution path.
///
/// An explicit mode wins. Otherwise a request for a live session, a
/// multi-line command, or one longer than `threshold` characters goes
/// interactive; everything else runs headless.
pub fn select_route(request: &ExecutionRequest, threshold: usize, live_session: bool) -> Route {
    match request.mode {
        RequestedMode::Headless => Route::Headless,
        RequestedMode::Interactive => Route::Interactive,
        RequestedMode::Auto => {
            if live_session
                || request.command.contains('\n')
                || request.command.chars().count() > threshold
            {
                Route::Interactive
            } else {
                Route::Headless
            }
        }
    }
}

/// Routes requests to the headless executor or the session manager.
pub struct Dispatcher {
    threshold: usize,
    default_timeout: Duration,
    extra_args: Vec<String>,
    locator: Arc<BinaryLocator>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    recovery: Arc<RecoveryManager>,
    registry: Arc<SessionRegistry>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threshold", &self.threshold)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: &BridgeConfig,
        locator: Arc<BinaryLocator>,
        sessions: Arc<SessionManager>,
        limiter: Arc<RateLimiter>,
        recovery: Arc<RecoveryManager>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            threshold: config.dispatch.interactive_threshold,
            default_timeout: config.session.timeout(),
            extra_args: config.binary.extra_args.clone(),
            locator,
            sessions,
            limiter,
            recovery,
            registry,
        }
    }

    /// Executes one request on behalf of `identity`.
    ///
    /// Returns `Err` only when the request is throttled. Every other failure
    /// comes back as an unsuccessful [`ExecutionResult`].
    pub async fn dispatch(
        &self,
        request: ExecutionRequest,
        identity: &str,
    ) -> Result<ExecutionResult, BridgeError> {
        self.dispatch_with_progress(request, identity, None).await
    }

    /// Like [`dispatch`](Self::dispatch), forwarding headless output chunks
    /// to `progress` as they arrive.
    pub async fn dispatch_with_progress(
        &self,
        request: ExecutionRequest,
        identity: &str,
        progress: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecutionResult, BridgeError> {
        let key = RateLimitKey::new(identity, EndpointClass::Ai);
        if let Err(e) = self.limiter.enforce(&key) {
            warn!(key = %key, request_id = %request.id, "Request throttled");
            return Err(e);
        }

        let live = match &request.session_id {
            Some(id) => self.sessions.is_live(id).await,
            None => false,
        };
        let route = select_route(&request, self.threshold, live);

        let backend = match self.locator.locate().await {
            Ok(info) => CliBackend::new(info, self.extra_args.clone()),
            Err(e) => {
                warn!(checked = e.checked.len(), "No CLI binary available");
                let mode = match route {
                    Route::Interactive => ExecutionMode::Complex,
                    Route::Headless => ExecutionMode::Simple,
                };
                return Ok(failure(mode, &request, None, Duration::ZERO, &BridgeError::from(e)));
            }
        };

        let format = backend.output_format(request.wants_text());
        let (mode, session_id) = match route {
            Route::Interactive => (
                ExecutionMode::Complex,
                Some(
                    request
                        .session_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                ),
            ),
            Route::Headless if format == OutputFormat::Json => (ExecutionMode::Headless, None),
            Route::Headless => (ExecutionMode::Simple, None),
        };
        let timeout = request.timeout().unwrap_or(self.default_timeout);

        info!(
            request_id = %request.id,
            %route,
            session_id = ?session_id,
            command_len = request.command.len(),
            "Dispatching request"
        );

        loop {
            let started = Instant::now();
            let attempt = match route {
                Route::Headless => {
                    HeadlessExecutor::new(backend.clone())
                        .run(
                            &request.command,
                            request.working_directory.as_deref(),
                            timeout,
                            format,
                            progress.as_ref(),
                        )
                        .await
                }
                Route::Interactive => {
                    self.run_interactive(&request, session_id.as_deref(), &backend, timeout)
                        .await
                }
            };

            let err = match attempt {
                Ok(result) => {
                    if result.success {
                        self.recovery.record_success();
                    }
                    debug!(request_id = %request.id, success = result.success, "Request finished");
                    return Ok(result);
                }
                Err(err) => err,
            };

            let Some(kind) = err.error_kind() else {
                return Ok(failure(mode, &request, session_id, started.elapsed(), &err));
            };

            // Subscribe before reporting so the signal cannot slip past
            let mut retry = self.recovery.subscribe(kind);
            let details =
                ErrorDetails::for_request(request.id.clone()).with_session(session_id.clone());

            match self.recovery.assess(kind, &err.to_string(), details) {
                RecoveryAction::Retry { attempt, delay } => {
                    debug!(request_id = %request.id, %kind, attempt, delay_ms = delay.as_millis() as u64, "Waiting for retry signal");
                    match tokio::time::timeout(delay + RETRY_SIGNAL_SLACK, retry.recv_for(&request.id))
                        .await
                    {
                        Ok(Some(signal)) => self.registry.publish(&signal.to_event()),
                        _ => debug!(request_id = %request.id, "Retry signal missed, retrying anyway"),
                    }
                }
                RecoveryAction::Fatal { .. } => {
                    return Ok(failure(mode, &request, session_id, started.elapsed(), &err));
                }
            }
        }
    }

    async fn run_interactive(
        &self,
        request: &ExecutionRequest,
        session_id: Option<&str>,
        backend: &CliBackend,
        timeout: Duration,
    ) -> Result<ExecutionResult, BridgeError> {
        let started = Instant::now();
        let handle = self
            .sessions
            .open_or_reuse(
                session_id,
                request.working_directory.as_deref(),
                &backend.interactive(),
            )
            .await?;
        let reply = handle.send(&request.command, timeout).await?;

        Ok(ExecutionResult::succeeded(
            ExecutionMode::Complex,
            &request.command,
            OutputPayload::Text(reply.output),
            started.elapsed(),
            Some(handle.id().to_string()),
        ))
    }
}

fn failure(
    mode: ExecutionMode,
    request: &ExecutionRequest,
    session_id: Option<String>,
    elapsed: Duration,
    err: &BridgeError,
) -> ExecutionResult {
    ExecutionResult::failed(
        mode,
        &request.command,
        OutputPayload::Text(String::new()),
        elapsed,
        session_id,
        err,
    )
}
