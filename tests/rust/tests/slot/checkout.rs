//! Checkout / checkin discipline tests

use depotlink_session::SlotError;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tests::fixtures;
use tests::{SessionConfig, SessionError, SessionHarness};

fn is_session_error(err: &SlotError, check: impl Fn(&SessionError) -> bool) -> bool {
    matches!(err, SlotError::Session(e) if check(e))
}

// ============================================================================
// Checkout
// ============================================================================

#[tokio::test]
async fn test_first_checkout_connects_and_validates() {
    let harness = SessionHarness::new();

    let lease = harness.slot.checkout().await.unwrap();

    assert!(lease.handle().is_connected());
    assert!(harness.slot.is_checked_out());
    assert!(harness.slot.has_validated_authentication());
    assert_eq!(harness.server.connects(), 1);
    assert_eq!(harness.server.probes(), 1);
}

#[tokio::test]
async fn test_validated_connection_is_reused_without_round_trips() {
    let harness = SessionHarness::new();

    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    let round_trips = harness.server.round_trips();

    let again = harness.slot.checkout().await.unwrap();
    assert_eq!(again.handle().id(), lease.handle().id());
    assert_eq!(harness.server.round_trips(), round_trips);
}

#[tokio::test]
async fn test_second_checkout_while_held_fails() {
    let harness = SessionHarness::new();
    let _lease = harness.slot.checkout().await.unwrap();

    let err = harness.slot.checkout().await.unwrap_err();
    assert!(is_session_error(&err, |e| matches!(e, SessionError::AlreadyCheckedOut { .. })));
}

#[tokio::test]
async fn test_at_most_one_checkout_outstanding_under_contention() {
    let harness = SessionHarness::new();
    let _lease = harness.slot.checkout().await.unwrap();

    let attempts = (0..10).map(|_| harness.slot.checkout());
    let results = futures::future::join_all(attempts).await;

    assert!(results.iter().all(|r| r.is_err()));
    assert!(harness.slot.is_checked_out());
}

#[tokio::test]
async fn test_failed_connect_surfaces_protocol_error_and_frees_slot() {
    let harness = SessionHarness::new();
    harness
        .server
        .fail_next_connect(tests::ProtocolError::connection("connection refused"));

    let err = harness.slot.checkout().await.unwrap_err();
    assert!(matches!(err, SlotError::Protocol(_)));
    assert!(!harness.slot.is_checked_out());

    harness.slot.checkout().await.unwrap();
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_dropped_connection_reconnects_on_checkout() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();

    harness.server.drop_connections();

    let lease = harness.slot.checkout().await.unwrap();
    assert!(lease.handle().is_connected());
    assert_eq!(harness.server.connects(), 2);
    assert_eq!(harness.slot.stats().connected, 2);
}

// ============================================================================
// Checkin
// ============================================================================

#[tokio::test]
async fn test_checkin_releases_slot() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();

    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    assert!(!harness.slot.is_checked_out());
}

#[tokio::test]
async fn test_double_checkin_fails_with_wrong_owner() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();

    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    let err = harness
        .slot
        .checkin(lease.owner(), lease.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::WrongOwner { .. }));
}

#[tokio::test]
async fn test_checkin_by_previous_holder_fails_with_wrong_owner() {
    let harness = SessionHarness::new();
    let first = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(first.owner(), first.handle()).await.unwrap();

    let second = harness.slot.checkout().await.unwrap();
    let err = harness
        .slot
        .checkin(first.owner(), second.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::WrongOwner { .. }));
    assert!(harness.slot.is_checked_out());
}

#[tokio::test]
async fn test_checkin_with_stale_handle_fails_with_wrong_handle() {
    let harness = SessionHarness::new();
    let first = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(first.owner(), first.handle()).await.unwrap();

    harness.server.drop_connections();
    let second = harness.slot.checkout().await.unwrap();
    assert_ne!(first.handle().id(), second.handle().id());

    let err = harness
        .slot
        .checkin(second.owner(), first.handle())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::WrongHandle { .. }));

    // The rightful checkin still works
    harness.slot.checkin(second.owner(), second.handle()).await.unwrap();
}

#[tokio::test]
async fn test_checkin_closes_handle_before_next_holder_can_take_it() {
    let harness = SessionHarness::with_config(SessionConfig {
        reconnect_with_each_request: true,
        ..fixtures::fast_config()
    });
    let first = harness.slot.checkout().await.unwrap();
    harness.server.delay_disconnects(Duration::from_millis(100));

    let (checkin, second) = tokio::join!(
        harness.slot.checkin(first.owner(), first.handle()),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            harness.slot.checkout().await
        }
    );

    checkin.unwrap();
    let second = second.unwrap();
    assert_ne!(second.handle().id(), first.handle().id());
    assert!(second.handle().is_connected());
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_reconnect_with_each_request_disconnects_on_checkin() {
    let harness = SessionHarness::with_config(SessionConfig {
        reconnect_with_each_request: true,
        ..fixtures::fast_config()
    });

    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    assert_eq!(harness.server.disconnects(), 1);

    harness.slot.checkout().await.unwrap();
    assert_eq!(harness.server.connects(), 2);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_abandoned_checkout_frees_slot_and_replaces_connection() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();

    harness.slot.abandon(lease.owner());
    assert!(!harness.slot.is_checked_out());

    let fresh = harness.slot.checkout().await.unwrap();
    assert_ne!(fresh.handle().id(), lease.handle().id());
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_dropped_lease_releases_slot_and_replaces_connection() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();
    let stale_id = lease.handle().id();

    drop(lease);
    assert!(!harness.slot.is_checked_out());

    let fresh = harness.slot.checkout().await.unwrap();
    assert_ne!(fresh.handle().id(), stale_id);
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_lease_dropped_after_checkin_leaves_slot_alone() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();

    let next = harness.slot.checkout().await.unwrap();
    drop(lease);

    assert!(harness.slot.is_checked_out());
    harness.slot.checkin(next.owner(), next.handle()).await.unwrap();
    assert_eq!(harness.server.connects(), 1);
}

#[tokio::test]
async fn test_disconnect_while_held_waits_for_checkin() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();

    harness.slot.disconnect().await.unwrap();
    assert_eq!(harness.server.disconnects(), 0);
    assert!(lease.handle().is_connected());

    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    harness.slot.checkout().await.unwrap();
    assert_eq!(harness.server.disconnects(), 1);
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_disposed_slot_rejects_checkout() {
    let harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();

    harness.slot.dispose().await.unwrap();
    assert_eq!(harness.server.disconnects(), 1);
    assert!(harness.slot.is_disposed());

    let err = harness.slot.checkout().await.unwrap_err();
    assert!(is_session_error(&err, |e| matches!(e, SessionError::Disposed { .. })));
}

#[tokio::test]
async fn test_connection_events_are_emitted() {
    let mut harness = SessionHarness::new();
    let lease = harness.slot.checkout().await.unwrap();
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    harness.slot.disconnect().await.unwrap();

    let events = harness.drain_events();
    assert_eq!(tests::events::count_of(&events, "server_connected"), 1);
    assert_eq!(tests::events::count_of(&events, "server_disconnected"), 1);
}

// ============================================================================
// Connect lock
// ============================================================================

#[tokio::test]
async fn test_dispose_during_reconnect_closes_the_new_session() {
    let harness = SessionHarness::new();
    harness.server.delay_connects(Duration::from_millis(200));

    let (checkout, disposed) = tokio::join!(harness.slot.checkout(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.slot.dispose().await
    });

    disposed.unwrap();
    let err = checkout.unwrap_err();
    assert!(is_session_error(&err, |e| matches!(e, SessionError::Disposed { .. })));
    assert_eq!(harness.server.live_sessions(), 0);
    assert_eq!(harness.server.disconnects(), 1);

    let err = harness.slot.checkout().await.unwrap_err();
    assert!(is_session_error(&err, |e| matches!(e, SessionError::Disposed { .. })));
}

#[tokio::test]
async fn test_disconnect_waits_for_reconnect_in_flight() {
    let harness = SessionHarness::new();
    harness.server.delay_connects(Duration::from_millis(100));

    let (checkout, disconnect) = tokio::join!(harness.slot.checkout(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.slot.disconnect().await
    });

    disconnect.unwrap();
    let lease = checkout.unwrap();
    assert!(lease.handle().is_connected());

    // The held connection was only marked stale
    harness.slot.checkin(lease.owner(), lease.handle()).await.unwrap();
    harness.slot.checkout().await.unwrap();
    assert_eq!(harness.server.connects(), 2);
}

#[tokio::test]
async fn test_slow_reconnect_times_out_disconnect_and_dispose() {
    let harness = SessionHarness::with_config(SessionConfig {
        connect_lock_timeout_ms: 50,
        ..fixtures::fast_config()
    });
    harness.server.delay_connects(Duration::from_millis(300));

    let (checkout, disconnect, disposed) = tokio::join!(
        harness.slot.checkout(),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            harness.slot.disconnect().await
        },
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            harness.slot.dispose().await
        }
    );

    assert!(matches!(disconnect.unwrap_err(), SessionError::LockTimeout { .. }));
    assert!(matches!(disposed.unwrap_err(), SessionError::LockTimeout { .. }));

    // The reconnect saw the dispose and closed what it opened
    let err = checkout.unwrap_err();
    assert!(is_session_error(&err, |e| matches!(e, SessionError::Disposed { .. })));
    assert!(harness.slot.is_disposed());
    assert_eq!(harness.server.live_sessions(), 0);
}
