//! Session Events - observable state changes of the session manager
//!
//! Emitted by the connection slot, gate and critical-error queue and
//! consumed by host UIs (status bars, notification panels) and tests.
//!
//! Events are facts that already happened; they never drive the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ServerIdentity;

/// What kind of operator-facing problem a critical error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    /// No usable password; someone has to provide one
    PasswordRequired,
    /// The server dropped our session token; log in again
    SessionExpired,
    /// Reconnect retries exhausted; the server is now offline
    Disconnected,
    ConfigInvalid,
    SslTrust,
    SslHandshake,
    /// Raised by another subsystem through the public API
    External,
}

impl ProblemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PasswordRequired => "password_required",
            Self::SessionExpired => "session_expired",
            Self::Disconnected => "disconnected",
            Self::ConfigInvalid => "config_invalid",
            Self::SslTrust => "ssl_trust",
            Self::SslHandshake => "ssl_handshake",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new protocol connection was opened
    ServerConnected { server: ServerIdentity },

    /// A protocol connection was closed or dropped
    ServerDisconnected { server: ServerIdentity },

    /// The gate for a server switched to online
    WentOnline { server: ServerIdentity },

    /// The gate for a server switched to offline
    WentOffline { server: ServerIdentity },

    /// The server configuration was found to be invalid
    ConfigInvalidated { server: ServerIdentity },

    /// Authentication exhausted its retries and latched the status
    LoginLatched {
        server: ServerIdentity,
        status: String,
    },

    /// A critical error was queued
    CriticalErrorRaised {
        id: u64,
        server: Option<ServerIdentity>,
        kind: ProblemKind,
        message: String,
        raised_at: DateTime<Utc>,
    },

    /// A critical error's handler finished (successfully or not)
    CriticalErrorResolved { id: u64, success: bool },

    /// A batch of warnings and notices was delivered
    WarningsDelivered { count: usize },
}

impl SessionEvent {
    /// Get event type name for logging/debugging
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ServerConnected { .. } => "server_connected",
            Self::ServerDisconnected { .. } => "server_disconnected",
            Self::WentOnline { .. } => "went_online",
            Self::WentOffline { .. } => "went_offline",
            Self::ConfigInvalidated { .. } => "config_invalidated",
            Self::LoginLatched { .. } => "login_latched",
            Self::CriticalErrorRaised { .. } => "critical_error_raised",
            Self::CriticalErrorResolved { .. } => "critical_error_resolved",
            Self::WarningsDelivered { .. } => "warnings_delivered",
        }
    }

    /// Server this event concerns, if any
    pub fn server(&self) -> Option<&ServerIdentity> {
        match self {
            Self::ServerConnected { server }
            | Self::ServerDisconnected { server }
            | Self::WentOnline { server }
            | Self::WentOffline { server }
            | Self::ConfigInvalidated { server }
            | Self::LoginLatched { server, .. } => Some(server),
            Self::CriticalErrorRaised { server, .. } => server.as_ref(),
            Self::CriticalErrorResolved { .. } | Self::WarningsDelivered { .. } => None,
        }
    }
}
