//! Connection Slot - exclusive holder of one server's live session
//!
//! ```text
//!   checkout ──► [latched?] ──► [held?] ──► reconnect if needed
//!                   │              │             │
//!             InvalidSession  AlreadyCheckedOut  ▼
//!                                        validate auth if stale ──► Lease
//!   checkin(owner, handle) ──► WrongOwner / WrongHandle / release
//! ```
//!
//! The handle is never shared: between checkout and checkin exactly one
//! caller may use it. Authentication is validated once per connection and
//! then trusted until a failure says otherwise. A lease dropped without
//! checkin abandons the checkout and the handle is replaced.
//!
//! Reconnects, `disconnect` and `dispose` serialize on the connect lock,
//! each waiting at most `connect_lock_timeout_ms`.

use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use depotlink_core::{
    AuthState, AuthenticationStatus, CredentialProvider, EventSender, ProtocolConnector,
    ProtocolError, ProtocolSession, ServerIdentity, SessionConfig, SessionError, SessionEvent,
};

use crate::auth::AuthenticationClassifier;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Identifies the caller holding a checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerToken(u64);

impl OwnerToken {
    fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live protocol session issued by a slot
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    session: Arc<dyn ProtocolSession>,
}

impl ConnectionHandle {
    fn new(session: Arc<dyn ProtocolSession>) -> Self {
        Self {
            id: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            session,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for ConnectionHandle {
    type Target = dyn ProtocolSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("connected", &self.session.is_connected())
            .finish()
    }
}

/// Proof of checkout: who holds the slot and with which handle.
///
/// Dropping a lease that was never checked in abandons the checkout.
#[derive(Debug)]
pub struct Lease {
    slot: Weak<ConnectionSlot>,
    owner: OwnerToken,
    handle: ConnectionHandle,
}

impl Lease {
    pub fn owner(&self) -> OwnerToken {
        self.owner
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // No-op once checked in: the slot no longer names this owner
        if let Some(slot) = self.slot.upgrade() {
            slot.abandon(self.owner);
        }
    }
}

/// Why a slot operation failed.
///
/// Protocol failures still need classification; session errors are final.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Lifetime counters of one slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub login_failed: u64,
    pub forced_authentications: u64,
    pub connected: u64,
    pub disconnected: u64,
}

impl fmt::Display for SlotStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loginFailed# {}, connected# {}, disconnected# {}, forcedLogin# {}",
            self.login_failed, self.connected, self.disconnected, self.forced_authentications
        )
    }
}

#[derive(Default)]
struct SlotState {
    handle: Option<ConnectionHandle>,
    checked_out_by: Option<OwnerToken>,
    validated: bool,
    invalid_login: Option<AuthenticationStatus>,
    /// Handle must be replaced before its next use
    stale: bool,
    disposed: bool,
    stats: SlotStats,
}

/// Holds the reservation made at the start of a checkout and releases it
/// if the checkout fails or its future is dropped.
struct Reservation<'a> {
    slot: &'a ConnectionSlot,
    owner: OwnerToken,
    armed: bool,
}

impl Reservation<'_> {
    fn keep(mut self) -> OwnerToken {
        self.armed = false;
        self.owner
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.slot.state.lock();
            if state.checked_out_by == Some(self.owner) {
                state.checked_out_by = None;
            }
        }
    }
}

pub struct ConnectionSlot {
    identity: ServerIdentity,
    connector: Arc<dyn ProtocolConnector>,
    credentials: Arc<dyn CredentialProvider>,
    classifier: AuthenticationClassifier,
    max_authentication_retries: u32,
    reconnect_with_each_request: bool,
    connect_lock_timeout: Duration,
    reconnect_backoff: Duration,
    state: parking_lot::Mutex<SlotState>,
    connect_lock: tokio::sync::Mutex<()>,
    events: EventSender,
}

impl ConnectionSlot {
    pub fn new(
        identity: ServerIdentity,
        connector: Arc<dyn ProtocolConnector>,
        credentials: Arc<dyn CredentialProvider>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            identity,
            connector,
            credentials,
            classifier: AuthenticationClassifier::new(Arc::new(config.patterns.clone())),
            max_authentication_retries: config.max_authentication_retries.max(1),
            reconnect_with_each_request: config.reconnect_with_each_request,
            connect_lock_timeout: config.connect_lock_timeout(),
            reconnect_backoff: config.reconnect_backoff(),
            state: parking_lot::Mutex::new(SlotState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            events: EventSender::detached(),
        }
    }

    /// Report connection changes on `events`
    pub fn with_event_sender(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn stats(&self) -> SlotStats {
        self.state.lock().stats
    }

    pub fn is_checked_out(&self) -> bool {
        self.state.lock().checked_out_by.is_some()
    }

    pub fn has_validated_authentication(&self) -> bool {
        self.state.lock().validated
    }

    /// The latched status, if authentication gave up on the current credential
    pub fn invalid_login(&self) -> Option<AuthenticationStatus> {
        self.state.lock().invalid_login.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    // ========================================================================
    // CHECKOUT / CHECKIN
    // ========================================================================

    /// Take exclusive use of the connection, reconnecting and validating
    /// authentication first when needed.
    pub async fn checkout(self: &Arc<Self>) -> Result<Lease, SlotError> {
        {
            let state = self.state.lock();
            if state.disposed {
                return Err(self.disposed_error().into());
            }
            if let Some(status) = &state.invalid_login {
                return Err(self.invalid_session(status).into());
            }
        }

        let reservation = self.reserve()?;

        if self.needs_reconnect() {
            self.reconnect_reserved().await?;
        }

        if !self.state.lock().validated {
            let status = self.authenticate_reserved().await;
            debug!(server = %self.identity, "[ConnectionSlot] Checkout validation: {}", status);
            if let Some(latched) = self.invalid_login() {
                return Err(self.invalid_session(&latched).into());
            }
        }

        let handle = self.current_handle().filter(|h| h.is_connected()).ok_or_else(|| {
            ProtocolError::NotConnected("connection lost while validating authentication".into())
        })?;

        Ok(Lease {
            slot: Arc::downgrade(self),
            owner: reservation.keep(),
            handle,
        })
    }

    /// Return the connection. Ownership and handle must match the checkout.
    pub async fn checkin(
        &self,
        owner: OwnerToken,
        handle: &ConnectionHandle,
    ) -> Result<(), SessionError> {
        let closing = {
            let mut state = self.state.lock();
            if state.checked_out_by != Some(owner) {
                return Err(SessionError::WrongOwner {
                    server: self.identity.clone(),
                });
            }
            if state.handle.as_ref().map(ConnectionHandle::id) != Some(handle.id()) {
                return Err(SessionError::WrongHandle {
                    server: self.identity.clone(),
                });
            }
            // Detach before releasing so the next holder never sees a
            // handle that is being closed
            let closing = if self.reconnect_with_each_request {
                Self::take_handle(&mut state)
            } else {
                None
            };
            state.checked_out_by = None;
            closing
        };

        if let Some(handle) = closing {
            self.close_handle(handle).await;
        }
        Ok(())
    }

    /// Release a checkout whose holder went away without checking in.
    ///
    /// The session may be mid-command, so it is replaced on next checkout.
    pub fn abandon(&self, owner: OwnerToken) {
        let mut state = self.state.lock();
        if state.checked_out_by == Some(owner) {
            warn!(server = %self.identity, "[ConnectionSlot] Checkout abandoned, marking connection stale");
            state.checked_out_by = None;
            state.stale = true;
        }
    }

    // ========================================================================
    // CONNECTION LIFECYCLE
    // ========================================================================

    /// Replace the session with a fresh one
    pub async fn reconnect(&self) -> Result<(), SlotError> {
        let _reservation = self.reserve()?;
        self.reconnect_reserved().await
    }

    /// Drop the session. A held connection is only marked stale; its
    /// holder finishes and the next checkout reconnects.
    ///
    /// Waits for an in-flight reconnect, up to the connect lock timeout.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let _lock = self.lock_connect().await?;
        let handle = {
            let mut state = self.state.lock();
            if state.checked_out_by.is_some() {
                state.stale = true;
                return Ok(());
            }
            Self::take_handle(&mut state)
        };
        if let Some(handle) = handle {
            self.close_handle(handle).await;
        }
        Ok(())
    }

    /// Forget the latched login failure and force a fresh reconnect on the
    /// next checkout
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.invalid_login = None;
        state.validated = false;
        state.stale = true;
        debug!(server = %self.identity, "[ConnectionSlot] Reset");
    }

    /// Disconnect for good; later checkouts fail with `Disposed`.
    ///
    /// The slot counts as disposed at once. A reconnect still in flight
    /// closes the session it opens; if it outlasts the connect lock timeout
    /// this returns `LockTimeout` and leaves the close to that reconnect.
    pub async fn dispose(&self) -> Result<(), SessionError> {
        self.state.lock().disposed = true;
        let _lock = self.lock_connect().await?;
        let handle = Self::take_handle(&mut self.state.lock());
        if let Some(handle) = handle {
            self.close_handle(handle).await;
        }
        info!(server = %self.identity, stats = %self.stats(), "[ConnectionSlot] Disposed");
        Ok(())
    }

    // ========================================================================
    // AUTHENTICATION
    // ========================================================================

    /// Make sure the session is authenticated, logging in when needed.
    ///
    /// With a latched login failure this returns the latched status without
    /// touching the network.
    pub async fn authenticate(&self) -> Result<AuthenticationStatus, SessionError> {
        {
            let state = self.state.lock();
            if state.disposed {
                return Ok(AuthenticationStatus::disposed());
            }
            if let Some(latched) = &state.invalid_login {
                return Ok(latched.clone());
            }
        }
        let _reservation = self.reserve()?;
        Ok(self.authenticate_reserved().await)
    }

    /// Discard the validated flag and authenticate again
    pub async fn reauthenticate(&self) -> Result<AuthenticationStatus, SessionError> {
        {
            let mut state = self.state.lock();
            state.validated = false;
            state.stats.forced_authentications += 1;
        }
        info!(server = %self.identity, "[ConnectionSlot] Forcing re-authentication");
        self.authenticate().await
    }

    async fn authenticate_reserved(&self) -> AuthenticationStatus {
        {
            let state = self.state.lock();
            if state.disposed {
                return AuthenticationStatus::disposed();
            }
            if let Some(latched) = &state.invalid_login {
                return latched.clone();
            }
        }

        // Closed after checkin, or dropped by the server
        if self.needs_reconnect() {
            if let Err(e) = self.reconnect_reserved().await {
                return self.status_for_slot_error(e);
            }
        }
        let mut handle = match self.current_handle() {
            Some(handle) => handle,
            None => return self.missing_handle_status(),
        };

        let mut status = self.classifier.discover_status(&*handle, &self.identity).await;
        if status.state() == AuthState::NotConnected {
            if let Err(e) = self.reconnect_reserved().await {
                return self.status_for_slot_error(e);
            }
            handle = match self.current_handle() {
                Some(handle) => handle,
                None => return self.missing_handle_status(),
            };
            status = self.classifier.discover_status(&*handle, &self.identity).await;
        }

        if status.is_authenticated() {
            self.mark_validated();
            return status;
        }

        let mut credential = self.fetch_credential().await;
        if credential.is_none() && status.state() == AuthState::PasswordRequired {
            debug!(server = %self.identity, "[ConnectionSlot] Password required and none known");
            return status;
        }

        for attempt in 0..self.max_authentication_retries {
            if attempt > 0 {
                tokio::time::sleep(self.reconnect_backoff * (attempt + 1)).await;
                if let Err(e) = self.reconnect_reserved().await {
                    status = self.status_for_slot_error(e);
                    if status.state() == AuthState::Disposed {
                        return status;
                    }
                    continue;
                }
                handle = match self.current_handle() {
                    Some(handle) => handle,
                    None => return self.missing_handle_status(),
                };
                credential = self.fetch_credential().await;
            }

            status = self
                .classifier
                .login(&*handle, &self.identity, &status, credential.take())
                .await;

            if status.is_authenticated() {
                self.mark_validated();
                return status;
            }
            if status.needs_user_action() || status.state() == AuthState::Disposed {
                return status;
            }
            debug!(
                server = %self.identity,
                attempt = attempt + 1,
                "[ConnectionSlot] Login attempt failed: {}", status
            );
        }

        {
            let mut state = self.state.lock();
            state.invalid_login = Some(status.clone());
            state.stats.login_failed += 1;
        }
        warn!(
            server = %self.identity,
            "[ConnectionSlot] Authentication retries exhausted, latching: {}", status
        );
        self.events.emit(SessionEvent::LoginLatched {
            server: self.identity.clone(),
            status: status.to_string(),
        });
        status
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn reserve(&self) -> Result<Reservation<'_>, SessionError> {
        let owner = OwnerToken::next();
        let mut state = self.state.lock();
        if state.disposed {
            return Err(self.disposed_error());
        }
        if state.checked_out_by.is_some() {
            return Err(SessionError::AlreadyCheckedOut {
                server: self.identity.clone(),
            });
        }
        state.checked_out_by = Some(owner);
        Ok(Reservation {
            slot: self,
            owner,
            armed: true,
        })
    }

    fn needs_reconnect(&self) -> bool {
        let state = self.state.lock();
        state.stale
            || state
                .handle
                .as_ref()
                .map_or(true, |handle| !handle.is_connected())
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        self.state.lock().handle.clone()
    }

    fn mark_validated(&self) {
        self.state.lock().validated = true;
    }

    /// Serializes reconnects against disconnect and dispose
    async fn lock_connect(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, SessionError> {
        tokio::time::timeout(self.connect_lock_timeout, self.connect_lock.lock())
            .await
            .map_err(|_| {
                SessionError::lock_timeout(
                    format!("connection lock for {}", self.identity),
                    self.connect_lock_timeout,
                )
            })
    }

    async fn reconnect_reserved(&self) -> Result<(), SlotError> {
        let _lock = self.lock_connect().await?;

        let previous = Self::take_handle(&mut self.state.lock());
        if let Some(handle) = previous {
            self.close_handle(handle).await;
        }
        if self.state.lock().disposed {
            return Err(self.disposed_error().into());
        }

        let credential = self
            .credentials
            .get_credential(&self.identity, false)
            .await
            .map_err(SessionError::from)?;
        let session = self.connector.connect(&self.identity, credential).await?;

        let stored = {
            let mut state = self.state.lock();
            if state.disposed {
                None
            } else {
                state.handle = Some(ConnectionHandle::new(Arc::clone(&session)));
                state.validated = false;
                state.stale = false;
                state.invalid_login = None;
                state.stats.connected += 1;
                Some(state.stats.connected)
            }
        };
        let Some(connected) = stored else {
            warn!(server = %self.identity, "[ConnectionSlot] Disposed while connecting, closing new session");
            if let Err(e) = session.disconnect().await {
                debug!(server = %self.identity, error = %e, "[ConnectionSlot] Error while disconnecting");
            }
            return Err(self.disposed_error().into());
        };
        info!(server = %self.identity, connected, "[ConnectionSlot] Connected");
        self.events.emit(SessionEvent::ServerConnected {
            server: self.identity.clone(),
        });
        Ok(())
    }

    fn take_handle(state: &mut SlotState) -> Option<ConnectionHandle> {
        state.validated = false;
        state.stale = false;
        state.handle.take()
    }

    async fn close_handle(&self, handle: ConnectionHandle) {
        if handle.is_connected() {
            if let Err(e) = handle.disconnect().await {
                debug!(server = %self.identity, error = %e, "[ConnectionSlot] Error while disconnecting");
            }
        }
        self.state.lock().stats.disconnected += 1;
        info!(server = %self.identity, "[ConnectionSlot] Disconnected");
        self.events.emit(SessionEvent::ServerDisconnected {
            server: self.identity.clone(),
        });
    }

    async fn fetch_credential(&self) -> Option<depotlink_core::OneUseCredential> {
        match self.credentials.get_credential(&self.identity, false).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(server = %self.identity, error = %e, "[ConnectionSlot] Credential lookup failed");
                None
            }
        }
    }

    fn status_for_slot_error(&self, error: SlotError) -> AuthenticationStatus {
        match error {
            SlotError::Protocol(e) => self.classifier.status_for(e),
            SlotError::Session(SessionError::Disposed { .. }) => AuthenticationStatus::disposed(),
            SlotError::Session(e) => {
                debug!(server = %self.identity, error = %e, "[ConnectionSlot] Reconnect failed");
                AuthenticationStatus::new(AuthState::NotConnected)
            }
        }
    }

    fn missing_handle_status(&self) -> AuthenticationStatus {
        if self.is_disposed() {
            AuthenticationStatus::disposed()
        } else {
            AuthenticationStatus::new(AuthState::NotConnected)
        }
    }

    fn invalid_session(&self, status: &AuthenticationStatus) -> SessionError {
        SessionError::InvalidSession {
            server: self.identity.clone(),
            status: status.clone(),
            cause: status.problem().cloned(),
        }
    }

    fn disposed_error(&self) -> SessionError {
        SessionError::Disposed {
            server: self.identity.clone(),
        }
    }
}

impl fmt::Display for ConnectionSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Slot {} ({}, invalidLogin? {}, validatedLogin? {})",
            self.identity,
            state.stats,
            state.invalid_login.is_some(),
            state.validated
        )
    }
}
