//! Error taxonomy
//!
//! Three layers:
//! - [`ProtocolError`]: raw failures raised by the protocol client
//! - [`ErrorKind`]: the closed classification every raw failure maps into
//! - [`SessionError`]: terminal errors surfaced to callers, each carrying
//!   the raw cause it was remapped from

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::domain::{AuthState, AuthenticationStatus, ServerIdentity};

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

// ============================================================================
// RAW PROTOCOL FAILURES
// ============================================================================

/// Why the server rejected an authentication attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureReason {
    NotLoggedIn,
    PasswordInvalid,
    PasswordUnnecessary,
    SessionExpired,
    SingleSignOn,
    Other,
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotLoggedIn => "not logged in",
            Self::PasswordInvalid => "password invalid",
            Self::PasswordUnnecessary => "password unnecessary",
            Self::SessionExpired => "session expired",
            Self::SingleSignOn => "single sign-on required",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// Failures raised by the protocol client.
///
/// The variants mirror the typed failures a remote VCS client library
/// reports. Which [`ErrorKind`] a variant ends up as can depend on its
/// message (see `classify` in the session crate), because the server often
/// reports distinct conditions through the same failure type.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("access denied: {0}")]
    Access(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("authentication failed ({reason}): {message}")]
    AuthenticationFailed {
        reason: AuthFailureReason,
        message: String,
    },

    #[error("login requires a password")]
    LoginRequiresPassword,

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connection failed: {message}")]
    Connection {
        message: String,
        #[source]
        cause: Option<Box<ProtocolError>>,
    },

    #[error("untrusted server: {0}")]
    Trust(String),

    #[error("ssl failure: {0}")]
    Ssl(String),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted")]
    Interrupted,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl ProtocolError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            cause: None,
        }
    }

    pub fn connection_caused_by(message: impl Into<String>, cause: ProtocolError) -> Self {
        Self::Connection {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// The innermost error of the cause chain
    pub fn root_cause(&self) -> &ProtocolError {
        match self {
            Self::Connection {
                cause: Some(cause), ..
            } => cause.root_cause(),
            other => other,
        }
    }

    /// Every message in the cause chain, outermost first, joined by `": "`
    pub fn full_message(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(err) = source {
            message.push_str(": ");
            message.push_str(&err.to_string());
            source = err.source();
        }
        message
    }
}

// ============================================================================
// TAXONOMY
// ============================================================================

/// Closed classification of everything that can go wrong talking to a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed response or internal protocol bug
    TransientProtocol,
    /// Password-shaped error; bad password and expired session look the same
    AmbiguousLoginFailure,
    LoginRequired,
    SessionExpired,
    NotLoggedIn,
    NotConnected,
    SslTrustProblem,
    SslHandshakeProblem,
    ConfigInvalid,
    ResourceExhausted,
    WorkingOffline,
    LockTimeout,
    Cancelled,
    GenericRemoteError,
}

impl ErrorKind {
    /// Retried locally with a fresh reconnect
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ResourceExhausted)
    }

    /// Never retried; always escalated as a critical error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigInvalid | Self::SslTrustProblem | Self::SslHandshakeProblem
        )
    }

    /// Resolved by (re-)authenticating
    pub fn is_login_problem(&self) -> bool {
        matches!(
            self,
            Self::AmbiguousLoginFailure
                | Self::LoginRequired
                | Self::SessionExpired
                | Self::NotLoggedIn
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientProtocol => "transient_protocol",
            Self::AmbiguousLoginFailure => "ambiguous_login_failure",
            Self::LoginRequired => "login_required",
            Self::SessionExpired => "session_expired",
            Self::NotLoggedIn => "not_logged_in",
            Self::NotConnected => "not_connected",
            Self::SslTrustProblem => "ssl_trust_problem",
            Self::SslHandshakeProblem => "ssl_handshake_problem",
            Self::ConfigInvalid => "config_invalid",
            Self::ResourceExhausted => "resource_exhausted",
            Self::WorkingOffline => "working_offline",
            Self::LockTimeout => "lock_timeout",
            Self::Cancelled => "cancelled",
            Self::GenericRemoteError => "generic_remote_error",
        };
        f.write_str(s)
    }
}

// ============================================================================
// CREDENTIAL ERRORS
// ============================================================================

/// Failures of the credential provider
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    #[error("credential prompt failed: {0}")]
    Prompt(String),

    #[error("credential provider has been disposed")]
    Disposed,
}

// ============================================================================
// TERMINAL ERRORS
// ============================================================================

/// Terminal errors surfaced by the session manager.
///
/// Working offline, bad credentials and invalid configuration are separate
/// variants so a host can react to each differently. Every variant that was
/// produced from a protocol failure keeps it as its `source()`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{server} is working offline")]
    WorkingOffline {
        server: ServerIdentity,
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("login to {server} failed ({status})")]
    LoginFailed {
        server: ServerIdentity,
        status: AuthenticationStatus,
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("{server} requires re-authentication")]
    RetryAuthentication {
        server: ServerIdentity,
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("{server} presented an untrusted SSL certificate")]
    SslTrust {
        server: ServerIdentity,
        #[source]
        cause: ProtocolError,
    },

    #[error("SSL handshake with {server} failed")]
    SslHandshake {
        server: ServerIdentity,
        #[source]
        cause: ProtocolError,
    },

    #[error("configuration for {server} is invalid")]
    ConfigInvalid {
        server: ServerIdentity,
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("protocol failure talking to {server}")]
    Protocol {
        server: ServerIdentity,
        #[source]
        cause: ProtocolError,
    },

    #[error("{server} rejected the request")]
    Remote {
        server: ServerIdentity,
        #[source]
        cause: ProtocolError,
    },

    #[error("timed out after {waited:?} waiting for {what}")]
    LockTimeout { what: String, waited: Duration },

    #[error("operation cancelled")]
    Cancelled {
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("session for {server} has an invalid login ({status})")]
    InvalidSession {
        server: ServerIdentity,
        status: AuthenticationStatus,
        #[source]
        cause: Option<ProtocolError>,
    },

    #[error("connection to {server} is already checked out")]
    AlreadyCheckedOut { server: ServerIdentity },

    #[error("connection to {server} checked in by a caller that does not hold it")]
    WrongOwner { server: ServerIdentity },

    #[error("incorrect connection handle checked in for {server}")]
    WrongHandle { server: ServerIdentity },

    #[error("session for {server} has been disposed")]
    Disposed { server: ServerIdentity },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl SessionError {
    pub fn lock_timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::LockTimeout {
            what: what.into(),
            waited,
        }
    }

    /// Taxonomy kind of this error.
    ///
    /// `None` for checkout discipline violations and credential provider
    /// failures, which are programming or host errors rather than server
    /// conditions.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::WorkingOffline { .. } => Some(ErrorKind::WorkingOffline),
            Self::LoginFailed { .. } => Some(ErrorKind::LoginRequired),
            Self::RetryAuthentication { .. } => Some(ErrorKind::SessionExpired),
            Self::SslTrust { .. } => Some(ErrorKind::SslTrustProblem),
            Self::SslHandshake { .. } => Some(ErrorKind::SslHandshakeProblem),
            Self::ConfigInvalid { .. } => Some(ErrorKind::ConfigInvalid),
            Self::Protocol { .. } => Some(ErrorKind::TransientProtocol),
            Self::Remote { .. } => Some(ErrorKind::GenericRemoteError),
            Self::LockTimeout { .. } => Some(ErrorKind::LockTimeout),
            Self::Cancelled { .. } => Some(ErrorKind::Cancelled),
            Self::InvalidSession { status, .. } => Some(status.state().error_kind()),
            Self::AlreadyCheckedOut { .. }
            | Self::WrongOwner { .. }
            | Self::WrongHandle { .. }
            | Self::Disposed { .. }
            | Self::Credential(_) => None,
        }
    }

    /// The protocol failure this error was remapped from, if any
    pub fn protocol_cause(&self) -> Option<&ProtocolError> {
        match self {
            Self::WorkingOffline { cause, .. }
            | Self::LoginFailed { cause, .. }
            | Self::RetryAuthentication { cause, .. }
            | Self::ConfigInvalid { cause, .. }
            | Self::Cancelled { cause }
            | Self::InvalidSession { cause, .. } => cause.as_ref(),
            Self::SslTrust { cause, .. }
            | Self::SslHandshake { cause, .. }
            | Self::Protocol { cause, .. }
            | Self::Remote { cause, .. } => Some(cause),
            _ => None,
        }
    }

    pub fn is_working_offline(&self) -> bool {
        matches!(self, Self::WorkingOffline { .. })
    }

    /// Bad or missing credentials, as opposed to connectivity or configuration
    pub fn is_login_failure(&self) -> bool {
        matches!(
            self,
            Self::LoginFailed { .. } | Self::RetryAuthentication { .. } | Self::InvalidSession { .. }
        )
    }
}

impl AuthState {
    /// Taxonomy kind a latched status of this state is surfaced as
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            AuthState::PasswordRequired => ErrorKind::LoginRequired,
            AuthState::SessionExpired => ErrorKind::SessionExpired,
            AuthState::NotLoggedIn => ErrorKind::NotLoggedIn,
            AuthState::NotConnected => ErrorKind::NotConnected,
            AuthState::ClientSetupProblem => ErrorKind::ConfigInvalid,
            AuthState::Disposed => ErrorKind::Cancelled,
            AuthState::Authenticated | AuthState::PasswordUnnecessary => {
                ErrorKind::GenericRemoteError
            }
        }
    }
}
