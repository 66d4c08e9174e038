//! Session Manager - the entry point for application code
//!
//! Owns one [`ServerSession`] (slot + gate + runner) per server identity,
//! the shared critical-error queue and the event bus. Construct it once,
//! pass it by reference, and call [`SessionManager::dispose`] on shutdown.
//!
//! ```ignore
//! let manager = SessionManager::new(SessionDeps::new(connector, credentials), SessionConfig::default());
//! let records = manager
//!     .run_operation(&identity, |conn| async move { conn.execute("changes", &args).await })
//!     .await?;
//! ```

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use depotlink_core::{
    CredentialProvider, EventBus, EventReceiver, ProblemKind, ProtocolConnector, ProtocolError,
    ServerIdentity, SessionConfig, SessionError, SessionResult,
};

use crate::alerts::{
    AlertCause, ConsumerExecutor, CriticalError, CriticalErrorHandler, CriticalErrorQueue,
    HandlerExecutor, LogWarningSink, ProblemHandlerFactory, ResolutionContext,
    StandardProblemHandlers, WarningSink,
};
use crate::gate::ConnectionGate;
use crate::runner::OperationRunner;
use crate::slot::{ConnectionHandle, ConnectionSlot, SlotStats};

/// Collaborators the manager is built from
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn ProtocolConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub handlers: Arc<dyn ProblemHandlerFactory>,
    pub executor: Arc<dyn HandlerExecutor>,
    pub warning_sink: Arc<dyn WarningSink>,
}

impl SessionDeps {
    /// Standard problem handlers, handlers run on the queue's consumer task,
    /// warnings go to the log
    pub fn new(
        connector: Arc<dyn ProtocolConnector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            connector,
            credentials,
            handlers: Arc::new(StandardProblemHandlers),
            executor: Arc::new(ConsumerExecutor),
            warning_sink: Arc::new(LogWarningSink),
        }
    }

    pub fn with_handlers(mut self, handlers: Arc<dyn ProblemHandlerFactory>) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn HandlerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_warning_sink(mut self, warning_sink: Arc<dyn WarningSink>) -> Self {
        self.warning_sink = warning_sink;
        self
    }
}

/// Everything that belongs to one server identity
pub struct ServerSession {
    slot: Arc<ConnectionSlot>,
    gate: Arc<ConnectionGate>,
    runner: OperationRunner,
}

impl ServerSession {
    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.slot
    }

    pub fn gate(&self) -> &Arc<ConnectionGate> {
        &self.gate
    }

    pub fn runner(&self) -> &OperationRunner {
        &self.runner
    }
}

pub struct SessionManager {
    config: SessionConfig,
    deps: SessionDeps,
    alerts: Arc<CriticalErrorQueue>,
    sessions: DashMap<ServerIdentity, Arc<ServerSession>>,
    event_bus: EventBus,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl SessionManager {
    /// Start the manager and its critical-error consumer. Must be called
    /// inside a tokio runtime.
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        let event_bus = EventBus::new();
        let alerts = CriticalErrorQueue::builder()
            .executor(Arc::clone(&deps.executor))
            .warning_sink(Arc::clone(&deps.warning_sink))
            .poll_timeout(config.alert_poll_timeout())
            .event_sender(event_bus.sender())
            .start();

        info!("[SessionManager] Started");
        Self {
            config,
            deps,
            alerts: Arc::new(alerts),
            sessions: DashMap::new(),
            event_bus,
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn alerts(&self) -> &Arc<CriticalErrorQueue> {
        &self.alerts
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    /// The session for `identity`, created on first use
    pub fn session(&self, identity: &ServerIdentity) -> SessionResult<Arc<ServerSession>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::Disposed {
                server: identity.clone(),
            });
        }
        if let Some(session) = self.sessions.get(identity) {
            return Ok(Arc::clone(session.value()));
        }

        let entry = self
            .sessions
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(self.build_session(identity)));
        Ok(Arc::clone(entry.value()))
    }

    fn build_session(&self, identity: &ServerIdentity) -> ServerSession {
        info!(server = %identity, "[SessionManager] Creating session");
        let events = self.event_bus.sender();
        let slot = Arc::new(
            ConnectionSlot::new(
                identity.clone(),
                Arc::clone(&self.deps.connector),
                Arc::clone(&self.deps.credentials),
                &self.config,
            )
            .with_event_sender(events.clone()),
        );
        let gate = Arc::new(
            ConnectionGate::new(identity.clone(), Arc::clone(&self.alerts), &self.config)
                .with_event_sender(events)
                .with_shutdown(self.shutdown.child_token()),
        );
        let context = ResolutionContext {
            slot: Arc::clone(&slot),
            gate: Arc::clone(&gate),
            credentials: Arc::clone(&self.deps.credentials),
        };
        let runner = OperationRunner::new(
            context,
            Arc::clone(&self.alerts),
            Arc::clone(&self.deps.handlers),
            &self.config,
        );
        ServerSession { slot, gate, runner }
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Run a user-invoked operation. Fails fast when the server is offline
    /// and bounds every wait.
    pub async fn run_operation<T, F, Fut>(&self, identity: &ServerIdentity, op: F) -> SessionResult<T>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let session = self.session(identity)?;
        let _permit = session.gate.enter_foreground().await?;
        session.runner.run(op).await
    }

    /// Run a background operation, waiting for the server to come online
    /// and for critical errors to be resolved first
    pub async fn run_background<T, F, Fut>(&self, identity: &ServerIdentity, op: F) -> SessionResult<T>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let session = self.session(identity)?;
        let _permit = session.gate.enter_background().await?;
        session.runner.run(op).await
    }

    // ========================================================================
    // ADMINISTRATION
    // ========================================================================

    /// Take the server offline and drop its connection
    pub async fn disconnect(&self, identity: &ServerIdentity) -> SessionResult<()> {
        let session = self.session(identity)?;
        session.gate.went_offline();
        session.slot.disconnect().await?;
        Ok(())
    }

    /// Bring the server online again. The next operation reconnects from
    /// scratch, which also clears a latched login failure.
    pub async fn go_online(&self, identity: &ServerIdentity) -> SessionResult<()> {
        let session = self.session(identity)?;
        session.gate.went_online()?;
        session.slot.reset();
        Ok(())
    }

    /// The server's configuration changed; let it go online again
    pub fn revalidate(&self, identity: &ServerIdentity) -> SessionResult<()> {
        let session = self.session(identity)?;
        session.gate.revalidate();
        session.slot.reset();
        Ok(())
    }

    pub fn is_online(&self, identity: &ServerIdentity) -> bool {
        self.sessions
            .get(identity)
            .map_or(true, |session| session.gate.is_online())
    }

    pub fn is_working_offline(&self, identity: &ServerIdentity) -> bool {
        self.sessions
            .get(identity)
            .map_or(self.disposed.load(Ordering::Acquire), |session| {
                session.gate.is_working_offline()
            })
    }

    pub fn slot_stats(&self, identity: &ServerIdentity) -> Option<SlotStats> {
        self.sessions.get(identity).map(|session| session.slot.stats())
    }

    /// Dispose one server's session; a later call creates a fresh one
    pub async fn forget_server(&self, identity: &ServerIdentity) {
        if let Some((_, session)) = self.sessions.remove(identity) {
            session.gate.dispose();
            if let Err(e) = session.slot.dispose().await {
                warn!(server = %identity, error = %e, "[SessionManager] Slot dispose incomplete");
            }
        }
    }

    // ========================================================================
    // ALERTS
    // ========================================================================

    pub fn add_warning(&self, message: impl Into<String>, cause: Option<AlertCause>) {
        self.alerts.add_warning(None, message, cause);
    }

    pub fn add_notice(&self, message: impl Into<String>) {
        self.alerts.add_notice(message);
    }

    /// Raise a problem detected outside an operation call
    pub fn add_critical_error(
        &self,
        identity: &ServerIdentity,
        message: impl Into<String>,
        handler: Arc<dyn CriticalErrorHandler>,
    ) -> u64 {
        self.alerts.add_critical_error(
            CriticalError::new(ProblemKind::External, message, handler).for_server(identity.clone()),
        )
    }

    pub fn pending_critical_errors(&self) -> usize {
        self.alerts.pending_count()
    }

    pub async fn wait_for_no_critical_errors(&self, timeout: Option<Duration>) -> SessionResult<bool> {
        self.alerts.wait_for_no_critical_errors(timeout).await
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Cancel background waits, disconnect every server and stop the queue
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let sessions: Vec<Arc<ServerSession>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.gate.dispose();
            if let Err(e) = session.slot.dispose().await {
                warn!(
                    server = %session.slot.identity(),
                    error = %e,
                    "[SessionManager] Slot dispose incomplete"
                );
            }
        }

        self.alerts.dispose().await;
        info!("[SessionManager] Disposed");
    }
}
