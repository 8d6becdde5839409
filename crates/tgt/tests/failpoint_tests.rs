#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the ticket factory.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p trustgate-tgt --features failpoints --test failpoint_tests
//! ```

#![cfg(feature = "failpoints")]

use std::time::Duration;

use trustgate_tgt::{
    TgtError, TicketEvent, UserRef,
    testutil::{CountingListener, memory_factory, test_config},
};

#[tokio::test]
async fn failed_insert_leaves_ticket_unpersisted() {
    let scenario = fail::FailScenario::setup();
    let factory = memory_factory(test_config(Duration::from_secs(60)));
    let events = CountingListener::new();
    factory.add_listener(events.clone());

    fail::cfg("factory-before-insert", "return").expect("failed to configure fail point");
    let mut ticket = factory.create_tgt(UserRef::new("alice"));
    let err = factory.persist(&mut ticket).await.expect_err("insert suppressed");

    assert!(matches!(err, TgtError::Storage(_)), "got: {err:?}");
    assert!(ticket.id().is_none(), "a failed insert must not leave an ID behind");
    assert_eq!(factory.size().await.expect("size"), 0);
    assert_eq!(events.count(TicketEvent::Create), 0);

    fail::remove("factory-before-insert");
    factory.persist(&mut ticket).await.expect("retry succeeds");
    assert_eq!(events.count(TicketEvent::Create), 1);

    scenario.teardown();
}

#[tokio::test]
async fn insert_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured; the insert should go through.

    let factory = memory_factory(test_config(Duration::from_secs(60)));
    let mut ticket = factory.create_tgt(UserRef::new("bob"));
    factory.persist(&mut ticket).await.expect("persist");
    assert!(factory.exists(ticket.id().expect("id")).await.expect("exists"));

    scenario.teardown();
}
