//! Alias index behaviour as seen through the ticket factory.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use trustgate_tgt::{
    AliasRole, AliasStore, TgtFactory, TicketId, UserRef,
    testutil::{memory_factory, test_config},
};

const HOUR: Duration = Duration::from_secs(3600);
const PERSISTENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent";
const TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

async fn persisted(factory: &TgtFactory, user: &str) -> TicketId {
    let mut ticket = factory.create_tgt(UserRef::new(user));
    factory.persist(&mut ticket).await.expect("persist");
    ticket.id().expect("id").clone()
}

#[tokio::test]
async fn stores_have_roles_and_separate_namespaces() {
    let factory = memory_factory(test_config(HOUR));
    let id = persisted(&factory, "alice").await;

    assert_eq!(factory.sp_aliases().role(), AliasRole::ServiceProvider);
    assert_eq!(factory.idp_aliases().role(), AliasRole::IdentityProvider);

    factory.sp_aliases().put_alias(PERSISTENT, "entity", &id, "sp-side").await.expect("put");
    let crossed = factory.idp_aliases().is_alias(PERSISTENT, "entity", "sp-side").await;
    assert!(!crossed.expect("is_alias"));
}

#[tokio::test]
async fn logout_removes_aliases_in_both_roles() {
    let factory = memory_factory(test_config(HOUR));
    let mut ticket = factory.create_tgt(UserRef::new("alice"));
    factory.persist(&mut ticket).await.expect("persist");
    let id = ticket.id().expect("id").clone();

    let sp = factory.sp_aliases();
    let idp = factory.idp_aliases();
    sp.put_alias(PERSISTENT, "https://sp1.example.org", &id, "p-1").await.expect("put");
    sp.put_alias(TRANSIENT, "https://sp1.example.org", &id, "t-1").await.expect("put");
    sp.put_alias(PERSISTENT, "https://sp2.example.org", &id, "p-2").await.expect("put");
    idp.put_alias(PERSISTENT, "https://idp.example.org", &id, "upstream").await.expect("put");

    ticket.expire();
    factory.persist(&mut ticket).await.expect("logout");

    assert_eq!(sp.get_alias(PERSISTENT, "https://sp1.example.org", &id).await.expect("get"), None);
    assert_eq!(sp.get_alias(PERSISTENT, "https://sp2.example.org", &id).await.expect("get"), None);
    assert!(!sp.is_alias(TRANSIENT, "https://sp1.example.org", "t-1").await.expect("is_alias"));
    let upstream = idp.get_ticket_id(PERSISTENT, "https://idp.example.org", "upstream").await;
    assert_eq!(upstream.expect("get"), None);
    assert!(sp.entities(&id).await.expect("entities").is_empty());
}

#[tokio::test]
async fn clean_removes_aliases_and_keeps_other_tickets() {
    let factory = memory_factory(test_config(HOUR));
    let mut doomed = factory.create_tgt(UserRef::new("alice"));
    factory.persist(&mut doomed).await.expect("persist");
    let doomed_id = doomed.id().expect("id").clone();
    let survivor = persisted(&factory, "bob").await;

    let sp = factory.sp_aliases();
    sp.put_alias(PERSISTENT, "sp1", &doomed_id, "a").await.expect("put");
    sp.put_alias(PERSISTENT, "sp1", &survivor, "b").await.expect("put");

    factory.clean(&doomed).await.expect("clean");

    assert_eq!(sp.get_alias(PERSISTENT, "sp1", &doomed_id).await.expect("get"), None);
    assert_eq!(sp.get_ticket_id(PERSISTENT, "sp1", "b").await.expect("get"), Some(survivor));
}

#[tokio::test]
async fn alias_reuse_moves_to_latest_ticket() {
    let factory = memory_factory(test_config(HOUR));
    let first = persisted(&factory, "alice").await;
    let second = persisted(&factory, "alice").await;
    let sp = factory.sp_aliases();

    sp.put_alias(PERSISTENT, "sp1", &first, "alice-at-sp1").await.expect("put");
    sp.put_alias(PERSISTENT, "sp1", &second, "alice-at-sp1").await.expect("put");

    let owner = sp.get_ticket_id(PERSISTENT, "sp1", "alice-at-sp1").await.expect("get");
    assert_eq!(owner, Some(second.clone()));
    assert_eq!(sp.get_alias(PERSISTENT, "sp1", &first).await.expect("get"), None);

    // Removing the first ticket must not take the moved alias with it.
    let mut first_copy = factory.retrieve(&first).await.expect("retrieve").expect("stored");
    first_copy.expire();
    factory.persist(&mut first_copy).await.expect("logout");
    assert!(sp.is_alias(PERSISTENT, "sp1", "alice-at-sp1").await.expect("is_alias"));
}

#[tokio::test]
async fn entity_ids_with_separators_are_kept_apart() {
    let factory = memory_factory(test_config(HOUR));
    let id = persisted(&factory, "alice").await;
    let sp = factory.sp_aliases();

    sp.put_alias("a.b", "c", &id, "one").await.expect("put");
    sp.put_alias("a", "b.c", &id, "two").await.expect("put");

    assert_eq!(sp.get_alias("a.b", "c", &id).await.expect("get").as_deref(), Some("one"));
    assert_eq!(sp.get_alias("a", "b.c", &id).await.expect("get").as_deref(), Some("two"));
    assert_eq!(sp.entities(&id).await.expect("entities"), vec!["b.c", "c"]);
}
