//! Pending-count bookkeeping and disposal

use async_trait::async_trait;
use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tests::async_helpers::{with_timeout, DEFAULT_TIMEOUT};
use tests::{BlockingHandler, ProblemKind, SessionError};

use depotlink_session::{
    handler_fn, AlertDetails, CriticalError, CriticalErrorHandler, CriticalErrorQueue,
    HandlerExecutor,
};

struct PanickingHandler;

#[async_trait]
impl CriticalErrorHandler for PanickingHandler {
    async fn handle_error(&self, _error: &AlertDetails) -> anyhow::Result<()> {
        panic!("handler exploded");
    }
}

/// Runs handlers on their own task, the way a UI host would
#[derive(Default)]
struct SpawningExecutor {
    jobs: AtomicUsize,
}

#[async_trait]
impl HandlerExecutor for SpawningExecutor {
    async fn execute(&self, job: BoxFuture<'static, ()>) {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        let _ = tokio::spawn(job).await;
    }
}

fn queue() -> CriticalErrorQueue {
    CriticalErrorQueue::builder()
        .poll_timeout(Duration::from_millis(50))
        .start()
}

fn external(message: &str, handler: Arc<dyn CriticalErrorHandler>) -> CriticalError {
    CriticalError::new(ProblemKind::External, message, handler)
}

#[tokio::test]
async fn test_pending_count_goes_up_and_back_down() {
    let queue = queue();
    let blocking = BlockingHandler::new();
    assert_eq!(queue.pending_count(), 0);

    queue.add_critical_error(external("disk full", blocking.clone()));
    assert_eq!(queue.pending_count(), 1);

    blocking.wait_started().await;
    assert_eq!(queue.pending_count(), 1);
    blocking.release();

    let waited = queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
    assert!(waited);
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn test_failing_handler_still_releases_count() {
    let queue = queue();
    queue.add_critical_error(external(
        "broken",
        Arc::new(handler_fn(|_| async { Err(anyhow::anyhow!("prompt window closed")) })),
    ));

    queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn test_panicking_handler_still_releases_count() {
    let queue = queue();
    queue.add_critical_error(external("explodes", Arc::new(PanickingHandler)));

    queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
    assert_eq!(queue.pending_count(), 0);

    // The consumer survived and keeps working
    queue.add_critical_error(external(
        "after",
        Arc::new(handler_fn(|_| async { Ok(()) })),
    ));
    queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bounded_wait_times_out_while_handler_runs() {
    let queue = queue();
    let blocking = BlockingHandler::new();
    queue.add_critical_error(external("slow", blocking.clone()));

    let err = queue
        .wait_for_no_critical_errors(Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::LockTimeout { .. }));

    blocking.release();
    queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unbounded_wait_returns_once_resolved() {
    let queue = Arc::new(queue());
    let blocking = BlockingHandler::new();
    queue.add_critical_error(external("slow", blocking.clone()));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.wait_for_no_critical_errors(None).await })
    };
    blocking.wait_started().await;
    assert!(!waiter.is_finished());

    blocking.release();
    let waited = with_timeout(DEFAULT_TIMEOUT, waiter).await.unwrap().unwrap();
    assert!(waited);
}

#[tokio::test]
async fn test_handlers_run_on_host_executor() {
    let executor = Arc::new(SpawningExecutor::default());
    let queue = CriticalErrorQueue::builder()
        .executor(executor.clone())
        .poll_timeout(Duration::from_millis(50))
        .start();

    queue.add_critical_error(external("one", Arc::new(handler_fn(|_| async { Ok(()) }))));
    queue.add_critical_error(external("two", Arc::new(handler_fn(|_| async { Ok(()) }))));
    queue
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();

    assert_eq!(executor.jobs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_handler_sees_details() {
    let queue = queue();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = parking_lot::Mutex::new(Some(tx));
    let handler = handler_fn(move |details: AlertDetails| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send((details.id, details.server.clone(), details.message.clone()));
        }
        async { Ok(()) }
    });

    let id = queue.add_critical_error(
        external("server certificate changed", Arc::new(handler))
            .for_server(tests::fixtures::identity()),
    );

    let (seen_id, server, message) = with_timeout(DEFAULT_TIMEOUT, rx).await.unwrap();
    assert_eq!(seen_id, id);
    assert_eq!(server, Some(tests::fixtures::identity()));
    assert_eq!(message, "server certificate changed");
}

#[tokio::test]
async fn test_dispose_releases_stuck_handler_and_queued_errors() {
    let queue = queue();
    let blocking = BlockingHandler::new();
    queue.add_critical_error(external("stuck", blocking.clone()));
    blocking.wait_started().await;
    queue.add_critical_error(external("queued", Arc::new(handler_fn(|_| async { Ok(()) }))));
    assert_eq!(queue.pending_count(), 2);

    with_timeout(DEFAULT_TIMEOUT, queue.dispose()).await;

    assert!(queue.is_disposed());
    assert_eq!(queue.pending_count(), 0);
    assert!(!queue.wait_for_no_critical_errors(None).await.unwrap());
}

#[tokio::test]
async fn test_add_after_dispose_is_ignored() {
    let queue = queue();
    queue.dispose().await;

    queue.add_critical_error(external("late", Arc::new(handler_fn(|_| async { Ok(()) }))));
    queue.add_warning(None, "late warning", None);
    assert_eq!(queue.pending_count(), 0);
}
