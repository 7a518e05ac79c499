//! The top-level `Bridge`: every component wired together, owned state only.

use crate::dispatcher::Dispatcher;
use crate::locator::{BinaryLocator, NotFoundError};
use crate::process::{ProcessLauncher, PtyLauncher};
use crate::session::{SessionManager, SessionStats};
use bridge_core::{
    BridgeConfig, EndpointClass, RateLimitKey, RateLimiter, RecoveryManager, SessionRegistry,
    ViewerChannel, ViewerId,
};
use bridge_proto::{BinaryInfo, BridgeError, ExecutionRequest, ExecutionResult, OutputChunk};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Background tasks started by [`Bridge::spawn_maintenance`]. Aborted on drop.
#[derive(Debug)]
pub struct MaintenanceTasks {
    sweeper: JoinHandle<()>,
    janitor: JoinHandle<()>,
}

impl Drop for MaintenanceTasks {
    fn drop(&mut self) {
        self.sweeper.abort();
        self.janitor.abort();
    }
}

/// Entry point for the IDE layer. Construct once and share by `Arc`.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    locator: Arc<BinaryLocator>,
    registry: Arc<SessionRegistry>,
    sessions: Arc<SessionManager>,
    limiter: Arc<RateLimiter>,
    recovery: Arc<RecoveryManager>,
    dispatcher: Dispatcher,
}

impl Bridge {
    /// A bridge running sessions in real pseudo-terminals.
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::with_launcher(config, Arc::new(PtyLauncher::new()))
    }

    pub fn with_launcher(
        config: BridgeConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, BridgeError> {
        let locator = BinaryLocator::new(config.binary.clone());
        Self::with_components(config, launcher, locator)
    }

    pub fn with_components(
        config: BridgeConfig,
        launcher: Arc<dyn ProcessLauncher>,
        locator: BinaryLocator,
    ) -> Result<Self, BridgeError> {
        let locator = Arc::new(locator);
        let registry = Arc::new(SessionRegistry::new(config.session.buffer_size));
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            launcher,
            Arc::clone(&registry),
        )?);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits));
        let recovery = Arc::new(RecoveryManager::new(config.recovery.clone()));
        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&locator),
            Arc::clone(&sessions),
            Arc::clone(&limiter),
            Arc::clone(&recovery),
            Arc::clone(&registry),
        );

        Ok(Self {
            config,
            locator,
            registry,
            sessions,
            limiter,
            recovery,
            dispatcher,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn locator(&self) -> &Arc<BinaryLocator> {
        &self.locator
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Probes (or returns the cached) CLI binary.
    pub async fn locate(&self) -> Result<BinaryInfo, NotFoundError> {
        self.locator.locate().await
    }

    pub async fn refresh_binary(&self) -> Result<BinaryInfo, NotFoundError> {
        self.locator.refresh().await
    }

    /// The command-execution call.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        identity: &str,
    ) -> Result<ExecutionResult, BridgeError> {
        self.dispatcher.dispatch(request, identity).await
    }

    pub async fn execute_with_progress(
        &self,
        request: ExecutionRequest,
        identity: &str,
        progress: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<ExecutionResult, BridgeError> {
        self.dispatcher
            .dispatch_with_progress(request, identity, Some(progress))
            .await
    }

    /// Attaches a viewer to a session's output, replaying recent history.
    pub fn attach(
        &self,
        session_id: &str,
        identity: &str,
        viewer: impl ViewerChannel + 'static,
    ) -> Result<ViewerId, BridgeError> {
        self.throttle_session(identity)?;
        Ok(self.registry.attach(session_id, viewer))
    }

    pub fn detach(&self, session_id: &str, viewer: ViewerId) -> bool {
        self.registry.detach(session_id, viewer)
    }

    pub async fn stop(&self, session_id: &str, identity: &str) -> Result<(), BridgeError> {
        self.throttle_session(identity)?;
        self.sessions.stop(session_id).await
    }

    pub async fn resize(
        &self,
        session_id: &str,
        identity: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), BridgeError> {
        self.throttle_session(identity)?;
        self.sessions.resize(session_id, cols, rows).await
    }

    pub async fn stats(&self) -> SessionStats {
        self.sessions.stats().await
    }

    /// Starts the rate-limit sweeper and the idle-session janitor.
    pub fn spawn_maintenance(&self) -> MaintenanceTasks {
        debug!(
            sweep_secs = self.config.rate_limits.sweep_interval().as_secs(),
            cleanup_secs = self.config.session.cleanup_interval().as_secs(),
            "Starting maintenance tasks"
        );
        MaintenanceTasks {
            sweeper: Arc::clone(&self.limiter).spawn_sweeper(self.config.rate_limits.sweep_interval()),
            janitor: Arc::clone(&self.sessions).spawn_janitor(),
        }
    }

    /// Stops every session.
    pub async fn shutdown(&self) {
        self.sessions.stop_all().await;
    }

    fn throttle_session(&self, identity: &str) -> Result<(), BridgeError> {
        self.limiter
            .enforce(&RateLimitKey::new(identity, EndpointClass::Session))
            .map(|_| ())
    }
}
