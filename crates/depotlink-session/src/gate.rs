//! Connection Gate - online/offline state and the connection lock
//!
//! Two kinds of callers pass through the gate before touching a server:
//!
//! - **foreground** (user-invoked): fail fast when offline and bound every
//!   wait, surfacing `LockTimeout` instead of hanging the caller
//! - **background**: wait as long as it takes for the server to come
//!   online and for pending critical errors to clear
//!
//! Both then hold the connection lock for the duration of their operation,
//! so reconnects and executions for one server never interleave.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use depotlink_core::{EventSender, ServerIdentity, SessionConfig, SessionError, SessionEvent};

use crate::alerts::CriticalErrorQueue;

/// Held while an operation runs; releases the connection lock on drop
pub struct GatePermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub struct ConnectionGate {
    identity: ServerIdentity,
    online: watch::Sender<bool>,
    config_valid: AtomicBool,
    disposed: AtomicBool,
    connection_lock: tokio::sync::Mutex<()>,
    alerts: Arc<CriticalErrorQueue>,
    foreground_wait: Duration,
    shutdown: CancellationToken,
    events: EventSender,
}

impl ConnectionGate {
    /// A gate starts online with a valid configuration
    pub fn new(identity: ServerIdentity, alerts: Arc<CriticalErrorQueue>, config: &SessionConfig) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            identity,
            online,
            config_valid: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            connection_lock: tokio::sync::Mutex::new(()),
            alerts,
            foreground_wait: config.foreground_wait(),
            shutdown: CancellationToken::new(),
            events: EventSender::detached(),
        }
    }

    pub fn with_event_sender(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Unbounded waits end with `Cancelled` once `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn is_config_valid(&self) -> bool {
        self.config_valid.load(Ordering::Acquire)
    }

    pub fn is_working_offline(&self) -> bool {
        self.disposed.load(Ordering::Acquire) || !self.is_config_valid() || !self.is_online()
    }

    // ========================================================================
    // STATE TRANSITIONS
    // ========================================================================

    /// Switch online and wake every background caller waiting for it
    pub fn went_online(&self) -> Result<(), SessionError> {
        if !self.is_config_valid() {
            return Err(SessionError::ConfigInvalid {
                server: self.identity.clone(),
                cause: None,
            });
        }
        if self.online.send_if_modified(|online| !std::mem::replace(online, true)) {
            info!(server = %self.identity, "[ConnectionGate] Online");
            self.events.emit(SessionEvent::WentOnline {
                server: self.identity.clone(),
            });
        }
        Ok(())
    }

    pub fn went_offline(&self) {
        if self.online.send_if_modified(|online| std::mem::replace(online, false)) {
            warn!(server = %self.identity, "[ConnectionGate] Offline");
            self.events.emit(SessionEvent::WentOffline {
                server: self.identity.clone(),
            });
        }
    }

    /// An operation just succeeded, so the server is reachable
    pub fn on_success(&self) {
        if !self.is_online() {
            let _ = self.went_online();
        }
    }

    /// The configuration cannot work; keep the server offline until it
    /// is revalidated
    pub fn mark_config_invalid(&self) {
        if self.config_valid.swap(false, Ordering::AcqRel) {
            warn!(server = %self.identity, "[ConnectionGate] Configuration marked invalid");
            self.events.emit(SessionEvent::ConfigInvalidated {
                server: self.identity.clone(),
            });
        }
        self.went_offline();
    }

    /// The configuration changed; allow going online again
    pub fn revalidate(&self) {
        self.config_valid.store(true, Ordering::Release);
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.went_offline();
    }

    // ========================================================================
    // WAITS
    // ========================================================================

    /// Wait until online. Returns whether it had to wait.
    pub async fn wait_for_online(&self, timeout: Option<Duration>) -> Result<bool, SessionError> {
        let mut rx = self.online.subscribe();
        if *rx.borrow_and_update() {
            return Ok(false);
        }

        debug!(server = %self.identity, "[ConnectionGate] Waiting to go online");
        let online = async move {
            let _ = rx.wait_for(|online| *online).await.map(|_| ());
        };
        match self.bounded(online, timeout).await? {
            Some(()) => Ok(true),
            None => Err(SessionError::lock_timeout(
                format!("{} to go online", self.identity),
                timeout.unwrap_or_default(),
            )),
        }
    }

    /// Admission for a user-invoked operation
    pub async fn enter_foreground(&self) -> Result<GatePermit<'_>, SessionError> {
        self.check_usable()?;
        if !self.is_online() {
            return Err(SessionError::WorkingOffline {
                server: self.identity.clone(),
                cause: None,
            });
        }

        self.alerts
            .wait_for_no_critical_errors(Some(self.foreground_wait))
            .await?;

        let guard = tokio::time::timeout(self.foreground_wait, self.connection_lock.lock())
            .await
            .map_err(|_| {
                SessionError::lock_timeout(
                    format!("connection lock for {}", self.identity),
                    self.foreground_wait,
                )
            })?;
        Ok(GatePermit { _guard: guard })
    }

    /// Admission for a background operation: waits out offline periods and
    /// unresolved critical errors
    pub async fn enter_background(&self) -> Result<GatePermit<'_>, SessionError> {
        loop {
            self.check_usable()?;
            self.wait_for_online(None).await?;

            self.bounded(self.alerts.wait_for_no_critical_errors(None), None)
                .await?
                .transpose()?;

            let guard = self
                .bounded(self.connection_lock.lock(), None)
                .await?
                .ok_or(SessionError::Cancelled { cause: None })?;

            // State may have changed while we queued for the lock
            if self.is_online() && self.alerts.pending_count() == 0 {
                return Ok(GatePermit { _guard: guard });
            }
            drop(guard);
            debug!(server = %self.identity, "[ConnectionGate] Gate changed while waiting, retrying");
        }
    }

    fn check_usable(&self) -> Result<(), SessionError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SessionError::Disposed {
                server: self.identity.clone(),
            });
        }
        if !self.is_config_valid() {
            return Err(SessionError::ConfigInvalid {
                server: self.identity.clone(),
                cause: None,
            });
        }
        Ok(())
    }

    /// Run `fut` until it finishes, `timeout` passes (`Ok(None)`) or
    /// shutdown is requested (`Err(Cancelled)`)
    async fn bounded<F: Future>(
        &self,
        fut: F,
        timeout: Option<Duration>,
    ) -> Result<Option<F::Output>, SessionError> {
        let limited = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
                None => Some(fut.await),
            }
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SessionError::Cancelled { cause: None }),
            output = limited => Ok(output),
        }
    }
}
