//! In-memory credential provider
//!
//! Lookup order for a server:
//! 1. a password given in the server's configuration
//! 2. a password remembered from an earlier prompt
//! 3. the host's [`PasswordPrompt`], only when the caller forces a prompt
//!
//! Long-term storage (OS keychain, password files) belongs to the host; wire
//! it in as the prompt or seed the provider with [`MemoryCredentialProvider::remember`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use depotlink_core::{CredentialError, CredentialProvider, OneUseCredential, ServerIdentity};

/// Host hook that asks the user for a password
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// `None` when the user cancelled
    async fn ask_password(
        &self,
        identity: &ServerIdentity,
    ) -> Result<Option<Zeroizing<String>>, CredentialError>;
}

#[derive(Default)]
pub struct MemoryCredentialProvider {
    configured: DashMap<ServerIdentity, Zeroizing<String>>,
    remembered: DashMap<ServerIdentity, Zeroizing<String>>,
    prompt: Option<Arc<dyn PasswordPrompt>>,
    disposed: AtomicBool,
}

impl MemoryCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PasswordPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Password that comes with the server configuration; it wins over
    /// anything remembered and is never forgotten
    pub fn with_configured_password(self, identity: ServerIdentity, password: impl Into<String>) -> Self {
        self.configured.insert(identity, Zeroizing::new(password.into()));
        self
    }

    pub fn remember(&self, identity: ServerIdentity, password: impl Into<String>) {
        let password = Zeroizing::new(password.into());
        if password.is_empty() {
            self.remembered.remove(&identity);
        } else {
            self.remembered.insert(identity, password);
        }
    }

    pub fn has_credential(&self, identity: &ServerIdentity) -> bool {
        self.configured.contains_key(identity) || self.remembered.contains_key(identity)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        self.remembered.clear();
    }

    fn check_disposed(&self) -> Result<(), CredentialError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(CredentialError::Disposed)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, identity: &ServerIdentity) -> Option<OneUseCredential> {
        self.configured
            .get(identity)
            .or_else(|| self.remembered.get(identity))
            .and_then(|secret| OneUseCredential::new(secret.as_str()))
    }

    async fn ask(&self, identity: &ServerIdentity) -> Result<bool, CredentialError> {
        let Some(prompt) = &self.prompt else {
            debug!(server = %identity, "[CredentialProvider] No prompt configured");
            return Ok(false);
        };
        match prompt.ask_password(identity).await? {
            Some(password) if !password.is_empty() => {
                self.remembered.insert(identity.clone(), password);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentialProvider {
    async fn get_credential(
        &self,
        identity: &ServerIdentity,
        force_prompt: bool,
    ) -> Result<Option<OneUseCredential>, CredentialError> {
        self.check_disposed()?;
        if force_prompt && !self.configured.contains_key(identity) {
            self.ask(identity).await?;
        }
        Ok(self.lookup(identity))
    }

    async fn forget_credential(&self, identity: &ServerIdentity) -> Result<(), CredentialError> {
        self.check_disposed()?;
        if self.remembered.remove(identity).is_some() {
            debug!(server = %identity, "[CredentialProvider] Forgot password");
        }
        Ok(())
    }

    async fn prompt_for_credential(&self, identity: &ServerIdentity) -> Result<bool, CredentialError> {
        self.check_disposed()?;
        self.ask(identity).await
    }
}
