//! Queue entries and the host hooks that process them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use depotlink_core::{ProblemKind, ServerIdentity};

/// Shared, type-erased cause attached to an alert
pub type AlertCause = Arc<dyn StdError + Send + Sync>;

/// Everything a handler gets to see about a critical error
#[derive(Clone)]
pub struct AlertDetails {
    /// Assigned by the queue when the error is added
    pub id: u64,
    pub server: Option<ServerIdentity>,
    pub kind: ProblemKind,
    pub message: String,
    pub cause: Option<AlertCause>,
    pub raised_at: DateTime<Utc>,
}

impl fmt::Debug for AlertDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertDetails")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .field("raised_at", &self.raised_at)
            .finish()
    }
}

/// Resolves one critical error; called exactly once.
///
/// Errors and panics are logged by the queue and still count as resolved.
#[async_trait]
pub trait CriticalErrorHandler: Send + Sync {
    async fn handle_error(&self, error: &AlertDetails) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`CriticalErrorHandler`]
pub struct FnHandler<F>(F);

/// Build a handler from `|details| async move { ... }`
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(AlertDetails) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> CriticalErrorHandler for FnHandler<F>
where
    F: Fn(AlertDetails) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle_error(&self, error: &AlertDetails) -> anyhow::Result<()> {
        (self.0)(error.clone()).await
    }
}

/// A critical error waiting to be resolved
pub struct CriticalError {
    pub(crate) details: AlertDetails,
    pub(crate) handler: Arc<dyn CriticalErrorHandler>,
}

impl CriticalError {
    pub fn new(
        kind: ProblemKind,
        message: impl Into<String>,
        handler: Arc<dyn CriticalErrorHandler>,
    ) -> Self {
        Self {
            details: AlertDetails {
                id: 0,
                server: None,
                kind,
                message: message.into(),
                cause: None,
                raised_at: Utc::now(),
            },
            handler,
        }
    }

    pub fn for_server(mut self, server: ServerIdentity) -> Self {
        self.details.server = Some(server);
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.details.cause = Some(Arc::new(cause));
        self
    }

    pub fn details(&self) -> &AlertDetails {
        &self.details
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningLevel {
    Warning,
    Notice,
}

/// A non-critical message, delivered in batches
#[derive(Clone)]
pub struct Warning {
    pub level: WarningLevel,
    pub server: Option<ServerIdentity>,
    pub message: String,
    pub cause: Option<AlertCause>,
    pub raised_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(level: WarningLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            server: None,
            message: message.into(),
            cause: None,
            raised_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Warning")
            .field("level", &self.level)
            .field("server", &self.server)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

/// Receives warning batches
pub trait WarningSink: Send + Sync {
    fn deliver(&self, batch: Vec<Warning>);
}

/// Default sink: one log line per warning
pub struct LogWarningSink;

impl WarningSink for LogWarningSink {
    fn deliver(&self, batch: Vec<Warning>) {
        for warning in batch {
            let server = warning
                .server
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            let cause = warning.cause.as_ref().map(|c| c.to_string()).unwrap_or_default();
            match warning.level {
                WarningLevel::Warning => {
                    warn!(server = %server, cause = %cause, "[CriticalErrorQueue] {}", warning.message)
                }
                WarningLevel::Notice => {
                    info!(server = %server, "[CriticalErrorQueue] {}", warning.message)
                }
            }
        }
    }
}

/// Where critical-error handlers run.
///
/// A GUI host binds this to its UI thread. The job releases its pending
/// count when it finishes or is dropped, so an executor may also refuse a
/// job by dropping it.
#[async_trait]
pub trait HandlerExecutor: Send + Sync {
    async fn execute(&self, job: BoxFuture<'static, ()>);
}

/// Runs handlers on the queue's consumer task, one at a time
pub struct ConsumerExecutor;

#[async_trait]
impl HandlerExecutor for ConsumerExecutor {
    async fn execute(&self, job: BoxFuture<'static, ()>) {
        job.await;
    }
}
