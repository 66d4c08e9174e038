//! Collaborator contracts
//!
//! The session engine never talks to the network or to a password store
//! directly. Hosts plug in:
//! - [`ProtocolConnector`] / [`ProtocolSession`]: the wire-protocol client
//! - [`CredentialProvider`]: password lookup, forgetting and prompting

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::domain::{OneUseCredential, ServerIdentity};
use crate::error::{CredentialError, ProtocolError};

// ============================================================================
// PROTOCOL CLIENT
// ============================================================================

/// One live session with a server.
///
/// Not safe for concurrent use; the connection slot guarantees a single
/// user at a time.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), ProtocolError>;

    /// Run a server command, returning its tagged output records
    async fn execute(&self, command: &str, args: &[String]) -> Result<Vec<Value>, ProtocolError>;

    /// Cheap read-only round trip ("who am I") used to test authentication
    async fn probe(&self, username: &str) -> Result<(), ProtocolError>;

    async fn login(&self, password: &str) -> Result<(), ProtocolError>;
}

/// Opens sessions.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Connect to `identity`, logging in with `credential` when one is known
    async fn connect(
        &self,
        identity: &ServerIdentity,
        credential: Option<OneUseCredential>,
    ) -> Result<Arc<dyn ProtocolSession>, ProtocolError>;
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// Resolves passwords per server identity.
///
/// Every call to `get_credential` returns a fresh [`OneUseCredential`];
/// the engine never keeps cleartext around between attempts.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Known password for `identity`. With `force_prompt` the provider may
    /// ask the user instead of answering from its cache.
    async fn get_credential(
        &self,
        identity: &ServerIdentity,
        force_prompt: bool,
    ) -> Result<Option<OneUseCredential>, CredentialError>;

    /// Drop any stored password for `identity`
    async fn forget_credential(&self, identity: &ServerIdentity) -> Result<(), CredentialError>;

    /// Ask the user for a password out of band. Returns whether one was
    /// provided. The engine only calls this from critical-error handlers.
    async fn prompt_for_credential(&self, identity: &ServerIdentity)
        -> Result<bool, CredentialError>;
}
