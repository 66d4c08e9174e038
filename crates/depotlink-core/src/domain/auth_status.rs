//! Authentication status of a live connection

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Closed set of authentication outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Authenticated,
    PasswordRequired,
    /// The server has no password for this user; still a usable session
    PasswordUnnecessary,
    SessionExpired,
    NotLoggedIn,
    NotConnected,
    ClientSetupProblem,
    Disposed,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::PasswordRequired => "password required",
            Self::PasswordUnnecessary => "password unnecessary",
            Self::SessionExpired => "session expired",
            Self::NotLoggedIn => "not logged in",
            Self::NotConnected => "not connected",
            Self::ClientSetupProblem => "client setup problem",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An [`AuthState`] plus the failure that produced it, if any.
///
/// Recomputed on demand; never persisted.
#[derive(Debug, Clone)]
pub struct AuthenticationStatus {
    state: AuthState,
    problem: Option<ProtocolError>,
}

impl AuthenticationStatus {
    pub fn new(state: AuthState) -> Self {
        Self {
            state,
            problem: None,
        }
    }

    pub fn authenticated() -> Self {
        Self::new(AuthState::Authenticated)
    }

    pub fn disposed() -> Self {
        Self::new(AuthState::Disposed)
    }

    pub fn with_problem(state: AuthState, problem: ProtocolError) -> Self {
        Self {
            state,
            problem: Some(problem),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn problem(&self) -> Option<&ProtocolError> {
        self.problem.as_ref()
    }

    pub fn into_problem(self) -> Option<ProtocolError> {
        self.problem
    }

    /// A password-unnecessary session counts as authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            AuthState::Authenticated | AuthState::PasswordUnnecessary
        )
    }

    /// Blind retries will not fix these; someone has to supply a credential
    pub fn needs_user_action(&self) -> bool {
        matches!(
            self.state,
            AuthState::PasswordRequired | AuthState::SessionExpired | AuthState::NotLoggedIn
        )
    }
}

impl PartialEq for AuthenticationStatus {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl fmt::Display for AuthenticationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Auth Result: {}", self.state)?;
        if let Some(problem) = &self.problem {
            write!(f, "; {}", problem)?;
        }
        Ok(())
    }
}
