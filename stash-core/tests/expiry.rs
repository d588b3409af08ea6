mod common;

use common::{Fixture, test_config};
use stash_core::{Holder, TxnError};
use std::time::Duration;
use tokio::sync::watch;

fn short_ttl_fixture() -> Fixture {
    let mut config = test_config();
    config.transaction.timeout_secs = 1;
    Fixture::with_config(config)
}

#[tokio::test]
async fn test_watchdog_expires_abandoned_transaction() {
    let fx = short_ttl_fixture();
    let gate = &fx.gate;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchdog = gate.spawn_watchdog(shutdown_rx);

    let id = gate.begin(Holder::new("crashed")).await.unwrap();
    gate.stage_create("crashed", id, "a.md", "x").await.unwrap();

    // a waiter queued behind the abandoned transaction gets the slot
    let next = gate
        .begin_transaction(Holder::new("next"), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(gate.transaction_status("next").is_owner);

    let err = gate
        .stage_update("crashed", id, "a.md", "y")
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::ExpiredTransaction(_)));
    assert!(matches!(
        gate.commit_transaction("crashed", id, "too late").await,
        Err(TxnError::ExpiredTransaction(_))
    ));

    // nothing from the expired journal reached the tree or history
    assert_eq!(fx.read("a.md").await, None);
    assert!(fx.history.is_empty().await);

    gate.abort_transaction("next", next).unwrap();
    shutdown_tx.send(true).unwrap();
    watchdog.await.unwrap();
}

#[tokio::test]
async fn test_deadline_checked_without_watchdog() {
    let fx = short_ttl_fixture();
    let gate = &fx.gate;

    let id = gate.begin(Holder::new("slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let status = gate.transaction_status("other");
    assert!(!status.has_active_transaction);
    assert!(matches!(
        gate.commit_transaction("slow", id, "late").await,
        Err(TxnError::ExpiredTransaction(_))
    ));
}

#[tokio::test]
async fn test_status_reports_remaining_budget() {
    let fx = short_ttl_fixture();
    let id = fx.gate.begin(Holder::new("s1")).await.unwrap();
    fx.gate.stage_create("s1", id, "a.md", "x").await.unwrap();

    let status = fx.gate.transaction_status("s1");
    assert_eq!(status.staged_operations, 1);
    let remaining = status.expires_in_ms.unwrap();
    assert!(remaining > 0 && remaining <= 1000);
}
