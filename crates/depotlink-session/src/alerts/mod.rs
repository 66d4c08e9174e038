//! Critical Error Queue - serialized hand-off of operator-facing problems
//!
//! One consumer task drains the queue:
//! - critical errors first, oldest first, one handler at a time
//! - then every pending warning as one batch
//! - otherwise it sleeps until signalled or until the poll timeout, so
//!   disposal is noticed promptly
//!
//! Enqueueing never blocks. The pending-critical count goes up when an error
//! is added and down when its handler finishes, whether the handler
//! succeeded, failed or panicked.

mod entry;
mod problems;

pub use entry::{
    handler_fn, AlertCause, AlertDetails, ConsumerExecutor, CriticalError, CriticalErrorHandler,
    FnHandler, HandlerExecutor, LogWarningSink, Warning, WarningLevel, WarningSink,
};
pub use problems::{
    ConnectionProblem, ProblemHandlerFactory, ReportOnlyHandler, ResolutionContext,
    StandardProblemHandlers,
};

use futures::FutureExt;
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use depotlink_core::{EventSender, ServerIdentity, SessionError, SessionEvent};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Entries {
    critical: VecDeque<CriticalError>,
    warnings: Vec<Warning>,
}

enum Next {
    Critical(CriticalError),
    Warnings(Vec<Warning>),
    Idle,
}

struct QueueInner {
    entries: parking_lot::Mutex<Entries>,
    pending: watch::Sender<usize>,
    wake: Notify,
    disposed: AtomicBool,
    next_id: AtomicU64,
    executor: Arc<dyn HandlerExecutor>,
    sink: Arc<dyn WarningSink>,
    poll_timeout: Duration,
    events: EventSender,
}

/// Releases one pending count when dropped
struct PendingGuard {
    inner: Arc<QueueInner>,
    id: u64,
    success: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.inner.events.emit(SessionEvent::CriticalErrorResolved {
            id: self.id,
            success: self.success,
        });
        self.inner.pending.send_modify(|count| *count = count.saturating_sub(1));
    }
}

pub struct CriticalErrorQueueBuilder {
    executor: Arc<dyn HandlerExecutor>,
    sink: Arc<dyn WarningSink>,
    poll_timeout: Duration,
    events: EventSender,
}

impl CriticalErrorQueueBuilder {
    pub fn executor(mut self, executor: Arc<dyn HandlerExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn warning_sink(mut self, sink: Arc<dyn WarningSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn event_sender(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Spawn the consumer task. Must be called inside a tokio runtime.
    pub fn start(self) -> CriticalErrorQueue {
        let (pending, _) = watch::channel(0usize);
        let inner = Arc::new(QueueInner {
            entries: parking_lot::Mutex::new(Entries::default()),
            pending,
            wake: Notify::new(),
            disposed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            executor: self.executor,
            sink: self.sink,
            poll_timeout: self.poll_timeout,
            events: self.events,
        });
        let consumer = tokio::spawn(run_consumer(Arc::clone(&inner)));
        CriticalErrorQueue {
            inner,
            consumer: parking_lot::Mutex::new(Some(consumer)),
        }
    }
}

pub struct CriticalErrorQueue {
    inner: Arc<QueueInner>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CriticalErrorQueue {
    pub fn builder() -> CriticalErrorQueueBuilder {
        CriticalErrorQueueBuilder {
            executor: Arc::new(ConsumerExecutor),
            sink: Arc::new(LogWarningSink),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            events: EventSender::detached(),
        }
    }

    /// Queue with default executor and sink. Must be called inside a tokio
    /// runtime.
    pub fn start() -> Self {
        Self::builder().start()
    }

    /// Queue a critical error, returning its id
    pub fn add_critical_error(&self, mut error: CriticalError) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        error.details.id = id;
        let raised = SessionEvent::CriticalErrorRaised {
            id,
            server: error.details.server.clone(),
            kind: error.details.kind,
            message: error.details.message.clone(),
            raised_at: error.details.raised_at,
        };

        {
            let mut entries = self.inner.entries.lock();
            if self.inner.disposed.load(Ordering::Acquire) {
                warn!(
                    message = %error.details.message,
                    "[CriticalErrorQueue] Disposed, dropping critical error"
                );
                return id;
            }
            entries.critical.push_back(error);
            self.inner.pending.send_modify(|count| *count += 1);
        }

        debug!(id, "[CriticalErrorQueue] Critical error queued");
        self.inner.events.emit(raised);
        self.inner.wake.notify_one();
        id
    }

    pub fn add_warning(
        &self,
        server: Option<ServerIdentity>,
        message: impl Into<String>,
        cause: Option<AlertCause>,
    ) {
        let mut warning = Warning::new(WarningLevel::Warning, message);
        warning.server = server;
        warning.cause = cause;
        self.push_warning(warning);
    }

    /// Informational message, delivered with the next warning batch
    pub fn add_notice(&self, message: impl Into<String>) {
        self.push_warning(Warning::new(WarningLevel::Notice, message));
    }

    /// Convenience for causes that are concrete error values
    pub fn add_warning_with_cause<E>(&self, server: Option<ServerIdentity>, message: impl Into<String>, cause: E)
    where
        E: StdError + Send + Sync + 'static,
    {
        self.add_warning(server, message, Some(Arc::new(cause)));
    }

    fn push_warning(&self, warning: Warning) {
        {
            let mut entries = self.inner.entries.lock();
            if self.inner.disposed.load(Ordering::Acquire) {
                return;
            }
            entries.warnings.push(warning);
        }
        self.inner.wake.notify_one();
    }

    /// Critical errors added but not yet resolved
    pub fn pending_count(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Block until no critical error is pending.
    ///
    /// Returns whether it had to wait. With a timeout, gives up with
    /// `LockTimeout`.
    pub async fn wait_for_no_critical_errors(
        &self,
        timeout: Option<Duration>,
    ) -> Result<bool, SessionError> {
        let mut rx = self.inner.pending.subscribe();
        if *rx.borrow_and_update() == 0 {
            return Ok(false);
        }

        let cleared = async move {
            // The sender lives as long as `inner`, so this cannot fail early
            let _ = rx.wait_for(|count| *count == 0).await.map(|_| ());
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, cleared)
                .await
                .map(|_| true)
                .map_err(|_| SessionError::lock_timeout("critical errors to clear", limit)),
            None => {
                cleared.await;
                Ok(true)
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stop the consumer and drop everything still queued.
    ///
    /// Dropped critical errors are released from the pending count so no
    /// waiter is left hanging.
    pub async fn dispose(&self) {
        let dropped = {
            let mut entries = self.inner.entries.lock();
            if self.inner.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
            let dropped = entries.critical.len();
            entries.critical.clear();
            entries.warnings.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "[CriticalErrorQueue] Dropping unresolved critical errors");
            self.inner
                .pending
                .send_modify(|count| *count = count.saturating_sub(dropped));
        }
        self.inner.wake.notify_one();

        let consumer = self.consumer.lock().take();
        if let Some(mut consumer) = consumer {
            if tokio::time::timeout(self.inner.poll_timeout, &mut consumer)
                .await
                .is_err()
            {
                warn!("[CriticalErrorQueue] Handler still running at dispose, aborting");
                consumer.abort();
                // Dropping the aborted handler releases its pending count
                let _ = consumer.await;
            }
        }
        info!("[CriticalErrorQueue] Disposed");
    }
}

impl Drop for CriticalErrorQueue {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        if let Some(consumer) = self.consumer.get_mut().take() {
            consumer.abort();
        }
    }
}

async fn run_consumer(inner: Arc<QueueInner>) {
    debug!("[CriticalErrorQueue] Consumer started");
    loop {
        if inner.disposed.load(Ordering::Acquire) {
            break;
        }

        let next = {
            let mut entries = inner.entries.lock();
            if let Some(error) = entries.critical.pop_front() {
                Next::Critical(error)
            } else if !entries.warnings.is_empty() {
                Next::Warnings(std::mem::take(&mut entries.warnings))
            } else {
                Next::Idle
            }
        };

        match next {
            Next::Critical(error) => dispatch(&inner, error).await,
            Next::Warnings(batch) => {
                let count = batch.len();
                inner.sink.deliver(batch);
                inner.events.emit(SessionEvent::WarningsDelivered { count });
            }
            Next::Idle => {
                let _ = tokio::time::timeout(inner.poll_timeout, inner.wake.notified()).await;
            }
        }
    }
    debug!("[CriticalErrorQueue] Consumer stopped");
}

async fn dispatch(inner: &Arc<QueueInner>, error: CriticalError) {
    let CriticalError { details, handler } = error;
    let mut guard = PendingGuard {
        inner: Arc::clone(inner),
        id: details.id,
        success: false,
    };

    let job = async move {
        let outcome = AssertUnwindSafe(handler.handle_error(&details))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                guard.success = true;
                debug!(id = details.id, "[CriticalErrorQueue] Critical error resolved");
            }
            Ok(Err(e)) => {
                warn!(
                    id = details.id,
                    error = %e,
                    "[CriticalErrorQueue] Handler failed for '{}'", details.message
                );
            }
            Err(_) => {
                error!(
                    id = details.id,
                    "[CriticalErrorQueue] Handler panicked for '{}'", details.message
                );
            }
        }
        drop(guard);
    }
    .boxed();

    inner.executor.execute(job).await;
}
