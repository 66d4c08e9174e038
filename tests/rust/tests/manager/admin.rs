//! Administrative control, alerts and disposal

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tests::async_helpers::{with_timeout, DEFAULT_TIMEOUT};
use tests::fixtures;
use tests::{BlockingHandler, ManagerHarness, ProtocolError, SessionError};

use super::{run_changes, run_changes_in_background};

#[tokio::test]
async fn test_disconnect_drops_connection_and_goes_offline() {
    let harness = ManagerHarness::new();
    run_changes(&harness, &fixtures::identity()).await.unwrap();

    harness.manager.disconnect(&fixtures::identity()).await.unwrap();

    assert_eq!(harness.server.disconnects(), 1);
    assert!(!harness.manager.is_online(&fixtures::identity()));
    let err = run_changes(&harness, &fixtures::identity()).await.unwrap_err();
    assert!(err.is_working_offline());
}

#[tokio::test]
async fn test_go_online_reconnects_on_next_operation() {
    let harness = ManagerHarness::new();
    run_changes(&harness, &fixtures::identity()).await.unwrap();
    harness.manager.disconnect(&fixtures::identity()).await.unwrap();

    harness.manager.go_online(&fixtures::identity()).await.unwrap();
    run_changes(&harness, &fixtures::identity()).await.unwrap();

    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_go_online_clears_latched_login() {
    let harness = ManagerHarness::new();
    for _ in 0..4 {
        harness
            .server
            .fail_next_probe(ProtocolError::Other("unexpected reply".to_string()));
    }

    let err = run_changes(&harness, &fixtures::identity()).await.unwrap_err();
    assert!(matches!(err, SessionError::InvalidSession { .. }));

    harness.manager.go_online(&fixtures::identity()).await.unwrap();
    run_changes(&harness, &fixtures::identity()).await.unwrap();
}

#[tokio::test]
async fn test_go_online_refused_while_config_invalid() {
    let harness = ManagerHarness::new();
    harness.server.fail_next_execute(fixtures::bad_config());
    let _ = run_changes(&harness, &fixtures::identity()).await;

    let err = harness
        .manager
        .go_online(&fixtures::identity())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ConfigInvalid { .. }));

    harness.manager.revalidate(&fixtures::identity()).unwrap();
    harness.manager.go_online(&fixtures::identity()).await.unwrap();
    run_changes(&harness, &fixtures::identity()).await.unwrap();
}

#[tokio::test]
async fn test_external_critical_error_holds_foreground_calls() {
    let harness = ManagerHarness::new();
    let blocking = BlockingHandler::new();
    harness.manager.add_critical_error(
        &fixtures::identity(),
        "depot is being restored from backup",
        blocking.clone(),
    );
    assert_eq!(harness.manager.pending_critical_errors(), 1);

    let err = run_changes(&harness, &fixtures::identity()).await.unwrap_err();
    assert!(matches!(err, SessionError::LockTimeout { .. }));

    blocking.release();
    harness
        .manager
        .wait_for_no_critical_errors(Some(DEFAULT_TIMEOUT))
        .await
        .unwrap();
    run_changes(&harness, &fixtures::identity()).await.unwrap();
}

#[tokio::test]
async fn test_warnings_reach_the_sink() {
    let harness = ManagerHarness::new();

    harness.manager.add_warning("workspace root is not writable", None);

    assert!(harness.warnings.wait_for_batch(DEFAULT_TIMEOUT).await);
    assert_eq!(
        harness.warnings.messages(),
        vec!["workspace root is not writable".to_string()]
    );
}

#[tokio::test]
async fn test_forget_server_disposes_its_session() {
    let harness = ManagerHarness::new();
    run_changes(&harness, &fixtures::identity()).await.unwrap();

    harness.manager.forget_server(&fixtures::identity()).await;
    assert_eq!(harness.server.disconnects(), 1);
    assert!(harness.manager.slot_stats(&fixtures::identity()).is_none());

    run_changes(&harness, &fixtures::identity()).await.unwrap();
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_dispose_cancels_background_waiters() {
    let harness = Arc::new(ManagerHarness::new());
    harness.manager.disconnect(&fixtures::identity()).await.unwrap();

    let task = {
        let harness = harness.clone();
        tokio::spawn(async move { run_changes_in_background(&harness, &fixtures::identity()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    with_timeout(DEFAULT_TIMEOUT, harness.manager.dispose()).await;

    let err = with_timeout(DEFAULT_TIMEOUT, task).await.unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Cancelled { .. }));

    let err = run_changes(&harness, &fixtures::identity()).await.unwrap_err();
    assert!(matches!(err, SessionError::Disposed { .. }));
}
