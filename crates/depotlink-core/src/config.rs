//! Session configuration
//!
//! Every field has a default, so a config file only needs the knobs it
//! changes:
//!
//! ```json
//! { "max_operation_retries": 1, "patterns": { "session_expired": "Ticket expired" } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning for connection slots, operation retries and alert handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Explicit login attempts made by one `authenticate()` call
    pub max_authentication_retries: u32,
    /// Retries one operation episode may use before going offline
    pub max_operation_retries: u32,
    /// Disconnect after every checkin
    pub reconnect_with_each_request: bool,
    /// Bound on acquiring the reconnect lock
    pub connect_lock_timeout_ms: u64,
    /// Base wait between login attempts, multiplied by the attempt number
    pub reconnect_backoff_ms: u64,
    /// Bound on every wait a foreground call makes
    pub foreground_wait_ms: u64,
    /// How long a session-expired retry waits for its notice to be resolved
    pub reauth_notice_wait_ms: u64,
    /// Poll interval of the critical-error consumer
    pub alert_poll_timeout_ms: u64,
    pub patterns: MessagePatterns,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_authentication_retries: 3,
            max_operation_retries: 2,
            reconnect_with_each_request: false,
            connect_lock_timeout_ms: 30_000,
            reconnect_backoff_ms: 10,
            foreground_wait_ms: 15_000,
            reauth_notice_wait_ms: 60_000,
            alert_poll_timeout_ms: 10_000,
            patterns: MessagePatterns::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn connect_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_lock_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn foreground_wait(&self) -> Duration {
        Duration::from_millis(self.foreground_wait_ms)
    }

    pub fn reauth_notice_wait(&self) -> Duration {
        Duration::from_millis(self.reauth_notice_wait_ms)
    }

    pub fn alert_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_poll_timeout_ms)
    }
}

/// Server message fragments used to tell failures apart.
///
/// The server reports several distinct conditions through the same error
/// type and only the message text differs, so these are data rather than
/// code. Matching is a case-sensitive substring search over the whole cause
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagePatterns {
    pub session_expired: String,
    pub password_invalid: String,
    pub password_unnecessary: String,
    pub login_required: String,
    pub ssl_fingerprint: String,
    pub ssl_handshake: String,
    pub config_problem: String,
    pub resource_exhausted: String,
}

impl Default for MessagePatterns {
    fn default() -> Self {
        Self {
            session_expired: "Your session has expired".to_string(),
            password_invalid: "Perforce password (P4PASSWD) invalid or unset".to_string(),
            password_unnecessary: "'login' not necessary, no password set for this user"
                .to_string(),
            login_required: "Perforce password (P4PASSWD)".to_string(),
            ssl_fingerprint: "The fingerprint for the public key sent to your client is"
                .to_string(),
            ssl_handshake: "invalid SSL session".to_string(),
            config_problem: "Unable to resolve Perforce server host name".to_string(),
            resource_exhausted: "Too many open files".to_string(),
        }
    }
}

impl MessagePatterns {
    fn matches(pattern: &str, message: &str) -> bool {
        !pattern.is_empty() && message.contains(pattern)
    }

    pub fn is_session_expired(&self, message: &str) -> bool {
        Self::matches(&self.session_expired, message)
    }

    pub fn is_password_invalid(&self, message: &str) -> bool {
        Self::matches(&self.password_invalid, message)
    }

    pub fn is_password_unnecessary(&self, message: &str) -> bool {
        Self::matches(&self.password_unnecessary, message)
    }

    pub fn is_login_required(&self, message: &str) -> bool {
        Self::matches(&self.login_required, message)
    }

    /// Any of the password-shaped messages
    pub fn is_password_problem(&self, message: &str) -> bool {
        self.is_session_expired(message)
            || self.is_password_invalid(message)
            || self.is_login_required(message)
    }

    pub fn is_ssl_fingerprint(&self, message: &str) -> bool {
        Self::matches(&self.ssl_fingerprint, message)
    }

    pub fn is_ssl_handshake(&self, message: &str) -> bool {
        Self::matches(&self.ssl_handshake, message)
    }

    pub fn is_config_problem(&self, message: &str) -> bool {
        Self::matches(&self.config_problem, message)
    }

    pub fn is_resource_exhausted(&self, message: &str) -> bool {
        Self::matches(&self.resource_exhausted, message)
    }
}

/// Where and how verbosely to log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily-rotated log files; console only when unset
    pub log_dir: Option<PathBuf>,
    /// File name prefix of the rotated logs
    pub file_prefix: String,
    /// Filter used when RUST_LOG is not set
    pub default_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            file_prefix: "depotlink".to_string(),
            default_level: "info".to_string(),
        }
    }
}
