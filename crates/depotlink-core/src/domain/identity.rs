//! Server identity - the key of one server configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one server configuration: where to connect and as whom.
///
/// Two identities are equal when every field matches, which makes this the
/// key for credential lookup and for deduplicating connections. Fields are
/// private so an identity cannot change after it has been used as a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerIdentity {
    host: String,
    port: u16,
    service_name: Option<String>,
    username: String,
}

impl ServerIdentity {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            service_name: None,
            username: username.into(),
        }
    }

    /// Attach a service name (for servers addressed through a broker or alias)
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `host:port` as the protocol client expects it
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)?;
        if let Some(service) = &self.service_name {
            write!(f, "/{}", service)?;
        }
        Ok(())
    }
}
