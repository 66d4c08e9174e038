//! Problem handlers - what happens when the runner escalates
//!
//! The runner describes what went wrong as a [`ConnectionProblem`]; a
//! [`ProblemHandlerFactory`] supplied by the host decides how it gets
//! resolved. [`StandardProblemHandlers`] prompts for credentials on login
//! problems and reports everything else.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use depotlink_core::{CredentialProvider, ProblemKind, ProtocolError, ServerIdentity};

use super::entry::{AlertDetails, CriticalErrorHandler};
use crate::gate::ConnectionGate;
use crate::slot::ConnectionSlot;

#[derive(Debug, Clone)]
pub struct ConnectionProblem {
    pub identity: ServerIdentity,
    pub kind: ProblemKind,
    pub message: String,
    pub cause: Option<ProtocolError>,
}

/// What a handler may act on to resolve a problem
#[derive(Clone)]
pub struct ResolutionContext {
    pub slot: Arc<ConnectionSlot>,
    pub gate: Arc<ConnectionGate>,
    pub credentials: Arc<dyn CredentialProvider>,
}

pub trait ProblemHandlerFactory: Send + Sync {
    fn handler_for(
        &self,
        problem: &ConnectionProblem,
        context: &ResolutionContext,
    ) -> Arc<dyn CriticalErrorHandler>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StandardProblemHandlers;

impl ProblemHandlerFactory for StandardProblemHandlers {
    fn handler_for(
        &self,
        problem: &ConnectionProblem,
        context: &ResolutionContext,
    ) -> Arc<dyn CriticalErrorHandler> {
        match problem.kind {
            ProblemKind::PasswordRequired | ProblemKind::SessionExpired => {
                Arc::new(CredentialPromptHandler {
                    context: context.clone(),
                })
            }
            _ => Arc::new(ReportOnlyHandler),
        }
    }
}

/// Asks the user for a password; on success forgets the latched failure
/// and brings the server back online
struct CredentialPromptHandler {
    context: ResolutionContext,
}

#[async_trait]
impl CriticalErrorHandler for CredentialPromptHandler {
    async fn handle_error(&self, error: &AlertDetails) -> anyhow::Result<()> {
        let identity = self.context.slot.identity();
        let provided = self
            .context
            .credentials
            .prompt_for_credential(identity)
            .await
            .with_context(|| format!("prompting for a password for {}", identity))?;

        if !provided {
            info!(server = %identity, "[ProblemHandlers] No password provided: {}", error.message);
            return Ok(());
        }

        self.context.slot.reset();
        self.context
            .gate
            .went_online()
            .with_context(|| format!("bringing {} back online", identity))?;
        info!(server = %identity, "[ProblemHandlers] New password accepted, server back online");
        Ok(())
    }
}

/// Logs the problem and leaves the server state as the runner set it
pub struct ReportOnlyHandler;

#[async_trait]
impl CriticalErrorHandler for ReportOnlyHandler {
    async fn handle_error(&self, error: &AlertDetails) -> anyhow::Result<()> {
        let server = error
            .server
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let cause = error.cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
        warn!(
            server = %server,
            kind = error.kind.as_str(),
            cause = %cause,
            "[ProblemHandlers] {}", error.message
        );
        Ok(())
    }
}
