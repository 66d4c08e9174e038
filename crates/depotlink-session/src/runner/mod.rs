//! Operation Runner - run, classify, retry or escalate
//!
//! Every remote call goes through [`OperationRunner::run`] exactly once:
//!
//! ```text
//!  checkout ─► op ─► checkin ─► ok ───────────────────────► gate.on_success
//!                         │
//!                         └─► classify
//!                               ├─ Cancelled ──────────────► surface, no escalation
//!                               ├─ ConfigInvalid / SSL ────► escalate + surface
//!                               ├─ NotConnected / Resource ► disconnect, retry
//!                               ├─ login problem ──────────► re-authenticate once, retry
//!                               └─ anything else ──────────► surface
//! ```
//!
//! An episode may retry at most `max_operation_retries` times; the next
//! retry it would need takes the server offline instead.

mod classify;
mod episode;

pub use classify::classify;
pub use episode::RetryEpisode;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

use depotlink_core::{
    AuthState, AuthenticationStatus, ErrorKind, MessagePatterns, ProblemKind, ProtocolError,
    ServerIdentity, SessionConfig, SessionError,
};

use crate::alerts::{
    ConnectionProblem, CriticalError, CriticalErrorQueue, ProblemHandlerFactory, ResolutionContext,
};
use crate::slot::{ConnectionHandle, SlotError};

pub struct OperationRunner {
    context: ResolutionContext,
    alerts: Arc<CriticalErrorQueue>,
    handlers: Arc<dyn ProblemHandlerFactory>,
    patterns: MessagePatterns,
    max_retries: u32,
    reauth_notice_wait: Duration,
}

impl OperationRunner {
    pub fn new(
        context: ResolutionContext,
        alerts: Arc<CriticalErrorQueue>,
        handlers: Arc<dyn ProblemHandlerFactory>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            context,
            alerts,
            handlers,
            patterns: config.patterns.clone(),
            max_retries: config.max_operation_retries,
            reauth_notice_wait: config.reauth_notice_wait(),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        self.context.slot.identity()
    }

    /// Run `op` against the server's connection, retrying and escalating as
    /// its failures dictate. `op` may be called more than once.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut episode = RetryEpisode::new(self.max_retries);
        let span = info_span!(
            "operation",
            server = %self.identity(),
            episode = %episode.id()
        );
        self.run_episode(&mut episode, &mut op).instrument(span).await
    }

    async fn run_episode<T, F, Fut>(
        &self,
        episode: &mut RetryEpisode,
        op: &mut F,
    ) -> Result<T, SessionError>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        loop {
            let error = match self.attempt(op).await {
                Ok(value) => {
                    self.context.gate.on_success();
                    if episode.retries() > 0 {
                        debug!(retries = episode.retries(), "[OperationRunner] Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(SlotError::Session(e)) => return Err(e),
                Err(SlotError::Protocol(e)) => e,
            };

            let kind = classify(&error, &self.patterns);
            episode.record(kind);
            debug!(
                attempt = episode.attempt(),
                kind = %kind,
                error = %error,
                "[OperationRunner] Attempt failed"
            );

            match kind {
                ErrorKind::Cancelled => {
                    return Err(SessionError::Cancelled { cause: Some(error) });
                }
                ErrorKind::ConfigInvalid => {
                    self.context.gate.mark_config_invalid();
                    self.escalate(
                        ProblemKind::ConfigInvalid,
                        format!("The connection settings for {} are invalid", self.identity()),
                        Some(&error),
                    );
                    return Err(SessionError::ConfigInvalid {
                        server: self.identity().clone(),
                        cause: Some(error),
                    });
                }
                ErrorKind::SslTrustProblem => {
                    self.escalate(
                        ProblemKind::SslTrust,
                        format!("{} presented an SSL fingerprint that is not trusted", self.identity()),
                        Some(&error),
                    );
                    return Err(SessionError::SslTrust {
                        server: self.identity().clone(),
                        cause: error,
                    });
                }
                ErrorKind::SslHandshakeProblem => {
                    self.escalate(
                        ProblemKind::SslHandshake,
                        format!("The SSL handshake with {} failed", self.identity()),
                        Some(&error),
                    );
                    return Err(SessionError::SslHandshake {
                        server: self.identity().clone(),
                        cause: error,
                    });
                }
                ErrorKind::NotConnected | ErrorKind::ResourceExhausted => {
                    self.context.slot.disconnect().await?;
                    self.retry_or_go_offline(episode, error)?;
                }
                ErrorKind::AmbiguousLoginFailure
                | ErrorKind::SessionExpired
                | ErrorKind::NotLoggedIn => {
                    self.recover_login(episode, error).await?;
                }
                ErrorKind::LoginRequired => {
                    let status =
                        AuthenticationStatus::with_problem(AuthState::PasswordRequired, error.clone());
                    return Err(self.login_failed(status, error));
                }
                ErrorKind::TransientProtocol => {
                    self.alerts.add_warning_with_cause(
                        Some(self.identity().clone()),
                        "The server sent a response that could not be understood",
                        error.clone(),
                    );
                    return Err(SessionError::Protocol {
                        server: self.identity().clone(),
                        cause: error,
                    });
                }
                ErrorKind::GenericRemoteError | ErrorKind::WorkingOffline | ErrorKind::LockTimeout => {
                    return Err(SessionError::Remote {
                        server: self.identity().clone(),
                        cause: error,
                    });
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(&self, op: &mut F) -> Result<T, SlotError>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let slot = &self.context.slot;
        // Dropping the lease mid-operation abandons the checkout
        let lease = slot.checkout().await?;

        let result = op(lease.handle().clone()).await;

        slot.checkin(lease.owner(), lease.handle()).await?;
        Ok(result?)
    }

    /// Re-authenticate once for a login-shaped failure. `Ok` means retry.
    async fn recover_login(
        &self,
        episode: &mut RetryEpisode,
        error: ProtocolError,
    ) -> Result<(), SessionError> {
        if episode.reauthenticated() {
            if episode.awaited_notice() {
                return Err(SessionError::RetryAuthentication {
                    server: self.identity().clone(),
                    cause: Some(error),
                });
            }
            // Fresh authentication and still rejected: the credential is bad
            let status =
                AuthenticationStatus::with_problem(AuthState::PasswordRequired, error.clone());
            return Err(self.login_failed(status, error));
        }

        episode.mark_reauthenticated();
        let status = self.context.slot.reauthenticate().await?;
        debug!("[OperationRunner] Re-authentication: {}", status);

        match status.state() {
            AuthState::Authenticated => self.retry_or_go_offline(episode, error),
            AuthState::PasswordUnnecessary => {
                if let Err(e) = self.context.credentials.forget_credential(self.identity()).await {
                    warn!(error = %e, "[OperationRunner] Could not forget unneeded password");
                }
                self.retry_or_go_offline(episode, error)
            }
            AuthState::NotConnected => {
                self.context.slot.disconnect().await?;
                self.retry_or_go_offline(episode, error)
            }
            AuthState::PasswordRequired | AuthState::NotLoggedIn => {
                Err(self.login_failed(status, error))
            }
            AuthState::SessionExpired => {
                self.escalate(
                    ProblemKind::SessionExpired,
                    format!("Your session on {} has expired; please log in again", self.identity()),
                    Some(&error),
                );
                episode.mark_awaited_notice();
                let resolved = self
                    .alerts
                    .wait_for_no_critical_errors(Some(self.reauth_notice_wait))
                    .await
                    .is_ok();
                if resolved && self.context.slot.invalid_login().is_none() {
                    self.retry_or_go_offline(episode, error)
                } else {
                    Err(SessionError::RetryAuthentication {
                        server: self.identity().clone(),
                        cause: Some(error),
                    })
                }
            }
            AuthState::ClientSetupProblem => {
                self.context.gate.mark_config_invalid();
                self.escalate(
                    ProblemKind::ConfigInvalid,
                    format!("The client setup for {} prevents logging in", self.identity()),
                    Some(&error),
                );
                Err(SessionError::ConfigInvalid {
                    server: self.identity().clone(),
                    cause: Some(status.into_problem().unwrap_or(error)),
                })
            }
            AuthState::Disposed => Err(SessionError::Disposed {
                server: self.identity().clone(),
            }),
        }
    }

    fn retry_or_go_offline(
        &self,
        episode: &mut RetryEpisode,
        error: ProtocolError,
    ) -> Result<(), SessionError> {
        if episode.try_retry() {
            debug!(retry = episode.retries(), "[OperationRunner] Retrying");
            return Ok(());
        }

        self.context.gate.went_offline();
        self.escalate(
            ProblemKind::Disconnected,
            format!("{} is not responding; working offline", self.identity()),
            Some(&error),
        );
        Err(SessionError::WorkingOffline {
            server: self.identity().clone(),
            cause: Some(error),
        })
    }

    fn login_failed(&self, status: AuthenticationStatus, error: ProtocolError) -> SessionError {
        self.escalate(
            ProblemKind::PasswordRequired,
            format!("A valid password is required for {}", self.identity()),
            Some(&error),
        );
        SessionError::LoginFailed {
            server: self.identity().clone(),
            status,
            cause: Some(error),
        }
    }

    fn escalate(&self, kind: ProblemKind, message: String, cause: Option<&ProtocolError>) {
        let problem = ConnectionProblem {
            identity: self.identity().clone(),
            kind,
            message,
            cause: cause.cloned(),
        };
        let handler = self.handlers.handler_for(&problem, &self.context);

        let mut entry = CriticalError::new(kind, problem.message.clone(), handler)
            .for_server(problem.identity.clone());
        if let Some(cause) = problem.cause {
            entry = entry.with_cause(cause);
        }
        let id = self.alerts.add_critical_error(entry);
        warn!(
            id,
            kind = kind.as_str(),
            "[OperationRunner] Escalated: {}", problem.message
        );
    }
}
