//! Authentication Classifier - turns probe and login outcomes into statuses
//!
//! Neither operation returns an error: every failure becomes an
//! [`AuthenticationStatus`] carrying the failure as its problem.

use std::sync::Arc;
use tracing::debug;

use depotlink_core::{
    AuthFailureReason, AuthState, AuthenticationStatus, MessagePatterns, OneUseCredential,
    ProtocolError, ProtocolSession, ServerIdentity,
};

pub struct AuthenticationClassifier {
    patterns: Arc<MessagePatterns>,
}

impl AuthenticationClassifier {
    pub fn new(patterns: Arc<MessagePatterns>) -> Self {
        Self { patterns }
    }

    /// Probe the session with a read-only "who am I" round trip
    pub async fn discover_status(
        &self,
        session: &dyn ProtocolSession,
        identity: &ServerIdentity,
    ) -> AuthenticationStatus {
        if !session.is_connected() {
            return AuthenticationStatus::new(AuthState::NotConnected);
        }

        match session.probe(identity.username()).await {
            Ok(()) => AuthenticationStatus::authenticated(),
            Err(e) => {
                let status = self.status_for(e);
                debug!(server = %identity, "[AuthClassifier] Probe: {}", status);
                status
            }
        }
    }

    /// Log in with `credential` (when there is one) and re-probe.
    ///
    /// A login the server answers with "no password needed" yields
    /// [`AuthState::PasswordUnnecessary`] once the re-probe succeeds, so the
    /// caller knows the stored password can be forgotten.
    pub async fn login(
        &self,
        session: &dyn ProtocolSession,
        identity: &ServerIdentity,
        status: &AuthenticationStatus,
        credential: Option<OneUseCredential>,
    ) -> AuthenticationStatus {
        if status.state() == AuthState::Disposed {
            return status.clone();
        }
        if !session.is_connected() {
            return AuthenticationStatus::new(AuthState::NotConnected);
        }

        let mut password_unnecessary = false;
        match credential {
            Some(credential) => {
                let secret = credential.reveal();
                if let Err(e) = session.login(secret.as_str()).await {
                    let failed = self.status_for(e);
                    if failed.state() != AuthState::PasswordUnnecessary {
                        debug!(server = %identity, "[AuthClassifier] Login: {}", failed);
                        return failed;
                    }
                    password_unnecessary = true;
                }
            }
            None => {
                debug!(
                    server = %identity,
                    previous = %status.state(),
                    "[AuthClassifier] No credential known, re-probing only"
                );
            }
        }

        let probed = self.discover_status(session, identity).await;
        if password_unnecessary && probed.is_authenticated() {
            AuthenticationStatus::new(AuthState::PasswordUnnecessary)
        } else {
            probed
        }
    }

    /// Map a probe or login failure to a status
    pub fn status_for(&self, error: ProtocolError) -> AuthenticationStatus {
        let message = error.full_message();
        let state = match &error {
            ProtocolError::NotConnected(_) | ProtocolError::Connection { .. } => {
                if matches!(error.root_cause(), ProtocolError::Config(_))
                    || self.patterns.is_config_problem(&message)
                {
                    AuthState::ClientSetupProblem
                } else {
                    AuthState::NotConnected
                }
            }
            ProtocolError::Trust(_) | ProtocolError::Ssl(_) | ProtocolError::Config(_) => {
                AuthState::ClientSetupProblem
            }
            ProtocolError::AuthenticationFailed { reason, .. } => match reason {
                AuthFailureReason::NotLoggedIn => AuthState::NotLoggedIn,
                AuthFailureReason::PasswordInvalid => AuthState::PasswordRequired,
                AuthFailureReason::PasswordUnnecessary => AuthState::PasswordUnnecessary,
                AuthFailureReason::SessionExpired | AuthFailureReason::SingleSignOn => {
                    AuthState::SessionExpired
                }
                AuthFailureReason::Other => AuthState::ClientSetupProblem,
            },
            ProtocolError::LoginRequiresPassword => AuthState::PasswordRequired,
            _ => {
                if self.patterns.is_password_unnecessary(&message) {
                    AuthState::PasswordUnnecessary
                } else if self.patterns.is_session_expired(&message) {
                    AuthState::SessionExpired
                } else if self.patterns.is_password_invalid(&message)
                    || self.patterns.is_login_required(&message)
                {
                    AuthState::PasswordRequired
                } else {
                    AuthState::ClientSetupProblem
                }
            }
        };
        AuthenticationStatus::with_problem(state, error)
    }
}
