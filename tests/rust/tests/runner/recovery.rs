//! Retry and re-authentication behaviour

use pretty_assertions::assert_eq;
use std::time::Duration;
use tests::fixtures::{
    ambiguous_login, dropped, fast_config, password_invalid, password_unnecessary, session_expired,
};
use tests::{
    BlockingHandler, MockCredentialProvider, ProblemKind, ProtocolError, RecordingHandlers,
    SessionConfig, SessionError, SessionHarness,
};

use super::{run_changes, settle};

#[tokio::test]
async fn test_reauthenticates_at_most_once_per_episode() {
    let harness = SessionHarness::new();
    harness.server.fail_next_execute(ambiguous_login());
    harness.server.fail_next_execute(ambiguous_login());

    let err = run_changes(&harness).await.unwrap_err();

    assert!(matches!(err, SessionError::LoginFailed { .. }));
    assert_eq!(harness.slot.stats().forced_authentications, 1);
    assert_eq!(harness.server.executes(), 2);
    assert_eq!(harness.handlers.kinds(), vec![ProblemKind::PasswordRequired]);
    settle(&harness).await;
}

#[tokio::test]
async fn test_each_operation_gets_its_own_reauthentication() {
    let harness = SessionHarness::new();

    harness.server.fail_next_execute(ambiguous_login());
    run_changes(&harness).await.unwrap();
    harness.server.fail_next_execute(ambiguous_login());
    run_changes(&harness).await.unwrap();

    assert_eq!(harness.slot.stats().forced_authentications, 2);
}

#[tokio::test]
async fn test_reauthentication_reconnects_when_connection_closed_on_checkin() {
    let harness = SessionHarness::with_config(SessionConfig {
        reconnect_with_each_request: true,
        ..fast_config()
    });
    harness.server.fail_next_execute(ambiguous_login());

    run_changes(&harness).await.unwrap();

    assert_eq!(harness.slot.stats().forced_authentications, 1);
    assert_eq!(harness.server.executes(), 2);
    assert_eq!(harness.server.connects(), 2);
    assert_eq!(harness.server.disconnects(), 2);
    assert!(harness.handlers.kinds().is_empty());
    assert!(!harness.slot.is_disposed());
}

#[tokio::test]
async fn test_mixed_failures_share_the_retry_cap() {
    let harness = SessionHarness::new();
    harness.server.fail_next_execute(dropped());
    harness.server.fail_next_execute(ambiguous_login());
    harness.server.fail_next_execute(dropped());

    let err = run_changes(&harness).await.unwrap_err();

    assert!(err.is_working_offline());
    assert_eq!(harness.server.executes(), 3);
    assert_eq!(harness.slot.stats().forced_authentications, 1);
    settle(&harness).await;
}

#[tokio::test]
async fn test_mixed_failures_within_cap_succeed() {
    let harness = SessionHarness::new();
    harness.server.fail_next_execute(ambiguous_login());
    harness.server.fail_next_execute(dropped());

    run_changes(&harness).await.unwrap();

    assert_eq!(harness.server.executes(), 3);
    assert!(harness.handlers.kinds().is_empty());
}

#[tokio::test]
async fn test_resource_exhaustion_is_retried_like_a_disconnect() {
    let harness = SessionHarness::new();
    harness
        .server
        .fail_next_execute(ProtocolError::Resource("Too many open files".to_string()));

    run_changes(&harness).await.unwrap();

    assert_eq!(harness.server.connects(), 2);
    assert_eq!(harness.server.executes(), 2);
}

#[tokio::test]
async fn test_password_unnecessary_forgets_stored_credential() {
    let harness = SessionHarness::new();
    harness.server.succeed_next_probe();
    harness.server.fail_next_probe(password_invalid());
    harness.server.fail_next_login(password_unnecessary());
    harness.server.fail_next_execute(ambiguous_login());

    run_changes(&harness).await.unwrap();

    assert_eq!(harness.credentials.forgets(), 1);
    assert!(harness.credentials.password().is_none());
    assert_eq!(harness.server.executes(), 2);
}

/// Script a re-authentication that ends with an expired session
fn script_expired_reauthentication(harness: &SessionHarness) {
    harness.server.succeed_next_probe();
    harness.server.fail_next_probe(session_expired());
    harness.server.fail_next_login(session_expired());
    harness.server.fail_next_execute(ambiguous_login());
}

#[tokio::test]
async fn test_expired_session_retries_after_new_password() {
    let harness = SessionHarness::new();
    harness.credentials.answer_prompt_with("correct-horse");
    script_expired_reauthentication(&harness);

    run_changes(&harness).await.unwrap();

    assert_eq!(harness.handlers.kinds(), vec![ProblemKind::SessionExpired]);
    assert_eq!(harness.credentials.prompts(), 1);
    assert_eq!(harness.credentials.password().as_deref(), Some("correct-horse"));
    assert_eq!(harness.server.executes(), 2);
    assert_eq!(harness.alerts.pending_count(), 0);
}

#[tokio::test]
async fn test_expired_session_unresolved_asks_to_retry_authentication() {
    let blocking = BlockingHandler::new();
    let harness = SessionHarness::with_parts(
        tests::fixtures::fast_config(),
        MockCredentialProvider::new().with_password(tests::fixtures::PASSWORD),
        RecordingHandlers::with_handler(blocking.clone()),
    );
    script_expired_reauthentication(&harness);

    let err = run_changes(&harness).await.unwrap_err();

    assert!(matches!(err, SessionError::RetryAuthentication { .. }));
    assert!(err.is_login_failure());
    assert_eq!(harness.server.executes(), 1);

    blocking.release();
    settle(&harness).await;
}

#[tokio::test]
async fn test_dropped_operation_releases_slot() {
    let harness = SessionHarness::new();

    let stuck = harness.runner.run(|_conn| async {
        futures::future::pending::<Result<(), ProtocolError>>().await
    });
    assert!(tokio::time::timeout(Duration::from_millis(50), stuck)
        .await
        .is_err());
    assert!(!harness.slot.is_checked_out());

    run_changes(&harness).await.unwrap();
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_success_brings_gate_back_online() {
    let harness = SessionHarness::new();
    harness.gate.went_offline();

    run_changes(&harness).await.unwrap();
    assert!(harness.gate.is_online());
}
