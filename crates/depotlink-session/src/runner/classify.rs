//! Failure classification
//!
//! The one place a raw [`ProtocolError`] becomes an [`ErrorKind`]. Checks run
//! from most to least specific: a connection failure whose message carries
//! an SSL fingerprint is a trust problem first and a disconnect second.

use depotlink_core::{AuthFailureReason, ErrorKind, MessagePatterns, ProtocolError};

pub fn classify(error: &ProtocolError, patterns: &MessagePatterns) -> ErrorKind {
    let message = error.full_message();

    match error {
        ProtocolError::Cancelled | ProtocolError::Interrupted | ProtocolError::Timeout(_) => {
            ErrorKind::Cancelled
        }
        ProtocolError::Protocol(_) => ErrorKind::TransientProtocol,
        ProtocolError::Trust(_) => ErrorKind::SslTrustProblem,
        ProtocolError::Ssl(_) => ErrorKind::SslHandshakeProblem,
        ProtocolError::Config(_) => ErrorKind::ConfigInvalid,
        ProtocolError::LoginRequiresPassword => ErrorKind::LoginRequired,
        ProtocolError::AuthenticationFailed { reason, .. } => match reason {
            AuthFailureReason::SessionExpired | AuthFailureReason::SingleSignOn => {
                ErrorKind::SessionExpired
            }
            AuthFailureReason::NotLoggedIn => ErrorKind::NotLoggedIn,
            AuthFailureReason::PasswordInvalid => ErrorKind::AmbiguousLoginFailure,
            AuthFailureReason::PasswordUnnecessary | AuthFailureReason::Other => {
                ErrorKind::GenericRemoteError
            }
        },
        ProtocolError::Connection { .. } | ProtocolError::NotConnected(_) => {
            if patterns.is_ssl_fingerprint(&message) {
                ErrorKind::SslTrustProblem
            } else if patterns.is_ssl_handshake(&message) {
                ErrorKind::SslHandshakeProblem
            } else if patterns.is_config_problem(&message)
                || matches!(error.root_cause(), ProtocolError::Config(_))
            {
                ErrorKind::ConfigInvalid
            } else if patterns.is_resource_exhausted(&message) {
                ErrorKind::ResourceExhausted
            } else {
                ErrorKind::NotConnected
            }
        }
        ProtocolError::Resource(_) => ErrorKind::ResourceExhausted,
        ProtocolError::Access(_) | ProtocolError::Request(_) | ProtocolError::Other(_) => {
            if patterns.is_password_problem(&message) {
                ErrorKind::AmbiguousLoginFailure
            } else if patterns.is_ssl_fingerprint(&message) {
                ErrorKind::SslTrustProblem
            } else if patterns.is_config_problem(&message) {
                ErrorKind::ConfigInvalid
            } else if patterns.is_resource_exhausted(&message) {
                ErrorKind::ResourceExhausted
            } else {
                ErrorKind::GenericRemoteError
            }
        }
    }
}
