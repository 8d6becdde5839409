//! Ticket factories sharing replicated maps on an in-process cluster.

#![allow(clippy::expect_used, clippy::panic)]

use std::{collections::HashSet, time::Duration};

use tokio::task::JoinSet;
use trustgate_storage::{LocalCluster, MemberId, StorageError, testutil::eventually};
use trustgate_tgt::{
    AliasStore, TgtError, TgtFactoryConfig, TicketEvent, UserRef,
    testutil::{CountingListener, clustered_factories, clustered_factory, test_config},
};

const HOUR: Duration = Duration::from_secs(3600);
const PERSISTENT: &str = "persistent";

#[tokio::test]
async fn ids_are_unique_across_nodes() {
    const PER_NODE: usize = 40;

    let cluster = LocalCluster::new();
    let nodes = clustered_factories(&cluster, "uniq", &["a", "b", "c"], &test_config(HOUR)).await;

    let mut tasks = JoinSet::new();
    for (n, factory) in nodes.iter().enumerate() {
        let factory = factory.clone();
        tasks.spawn(async move {
            let mut ids = Vec::with_capacity(PER_NODE);
            for i in 0..PER_NODE {
                let mut ticket = factory.create_tgt(UserRef::new(format!("user-{n}-{i}")));
                factory.persist(&mut ticket).await.expect("persist");
                ids.push(ticket.id().expect("id").clone());
            }
            ids
        });
    }

    let mut all = HashSet::new();
    while let Some(ids) = tasks.join_next().await {
        for id in ids.expect("task panicked") {
            assert!(all.insert(id), "duplicate ticket ID across nodes");
        }
    }
    assert_eq!(all.len(), PER_NODE * nodes.len());

    let expected = all.len();
    let nodes_ref = &nodes;
    let converged = eventually(Duration::from_secs(2), move || async move {
        for node in nodes_ref {
            if node.size().await.ok() != Some(expected) {
                return false;
            }
        }
        true
    })
    .await;
    assert!(converged, "every node should see every ticket");

    for node in &nodes {
        node.stop().await.expect("stop");
    }
}

#[tokio::test]
async fn ticket_persisted_on_one_node_is_retrievable_on_another() {
    let cluster = LocalCluster::new();
    let nodes = clustered_factories(&cluster, "xnode", &["a", "b"], &test_config(HOUR)).await;

    let mut ticket = nodes[0].create_tgt(UserRef::new("alice"));
    ticket.add_requestor_id("sp1");
    nodes[0].persist(&mut ticket).await.expect("persist");
    let id = ticket.id().expect("id").clone();

    let b = &nodes[1];
    let id_ref = &id;
    assert!(
        eventually(Duration::from_secs(2), move || async move {
            matches!(b.retrieve(id_ref).await, Ok(Some(_)))
        })
        .await
    );

    // b logs the user out; a observes the removal.
    let mut copy = nodes[1].retrieve(&id).await.expect("retrieve").expect("stored");
    copy.expire();
    nodes[1].persist(&mut copy).await.expect("logout");

    let a = &nodes[0];
    assert!(
        eventually(Duration::from_secs(2), move || async move {
            matches!(a.exists(id_ref).await, Ok(false))
        })
        .await
    );
}

#[tokio::test]
async fn double_expiry_on_two_nodes_is_tolerated() {
    let cluster = LocalCluster::new();
    let config = test_config(Duration::from_millis(100));
    let nodes = clustered_factories(&cluster, "double", &["a", "b"], &config).await;
    let events = CountingListener::new();
    for node in &nodes {
        node.add_listener(events.clone());
    }

    let mut keep = nodes[0].create_tgt(UserRef::new("bystander"));
    keep.add_requestor_id("sp1");
    let mut doomed = nodes[0].create_tgt(UserRef::new("victim"));
    doomed.add_requestor_id("sp1");
    nodes[0].persist(&mut keep).await.expect("persist");
    nodes[0].persist(&mut doomed).await.expect("persist");
    let doomed_id = doomed.id().expect("id").clone();
    nodes[0]
        .sp_aliases()
        .put_alias(PERSISTENT, "sp1", keep.id().expect("id"), "keep-alias")
        .await
        .expect("alias");
    nodes[0]
        .sp_aliases()
        .put_alias(PERSISTENT, "sp1", &doomed_id, "doomed-alias")
        .await
        .expect("alias");

    tokio::time::sleep(Duration::from_millis(150)).await;

    // Both nodes hold an expired copy and persist it.
    let mut copy = doomed.clone();
    nodes[0].persist(&mut doomed).await.expect("first expiry");
    nodes[1].persist(&mut copy).await.expect("second expiry");

    assert_eq!(events.count_for(TicketEvent::Expire, &doomed_id), 2);
    assert_eq!(
        nodes[0].sp_aliases().get_alias(PERSISTENT, "sp1", &doomed_id).await.expect("get"),
        None
    );
    assert_eq!(
        nodes[0]
            .sp_aliases()
            .get_alias(PERSISTENT, "sp1", keep.id().expect("id"))
            .await
            .expect("get")
            .as_deref(),
        Some("keep-alias"),
        "other tickets keep their aliases"
    );
}

#[tokio::test]
async fn late_node_receives_existing_tickets() {
    let cluster = LocalCluster::new();
    let config = test_config(HOUR);
    let first = clustered_factories(&cluster, "late", &["a"], &config).await;

    let mut ticket = first[0].create_tgt(UserRef::new("alice"));
    first[0].persist(&mut ticket).await.expect("persist");

    let late = clustered_factory(&cluster, "b", "late", config);
    late.start().await.expect("state transfer");
    assert!(late.retrieve(ticket.id().expect("id")).await.expect("retrieve").is_some());
}

#[tokio::test]
async fn join_timeout_is_fatal() {
    let cluster = LocalCluster::new();
    let _seed = clustered_factories(&cluster, "timeout", &["a"], &test_config(HOUR)).await;
    cluster.partition(&MemberId::from("a"));

    let config = TgtFactoryConfig { join_timeout: Duration::from_millis(100), ..test_config(HOUR) };
    let joiner = clustered_factory(&cluster, "b", "timeout", config);
    let err = joiner.start().await.expect_err("seed unreachable");

    assert!(matches!(err, TgtError::Storage(StorageError::Timeout { .. })), "got: {err:?}");
    assert!(!joiner.is_started());
    assert_eq!(cluster.group_members("timeout.tgt"), vec![MemberId::from("a")]);
}

#[tokio::test]
async fn stopped_factory_leaves_every_group() {
    let cluster = LocalCluster::new();
    let nodes = clustered_factories(&cluster, "leave", &["a", "b"], &test_config(HOUR)).await;

    nodes[1].stop().await.expect("stop");
    for group in ["leave.tgt", "leave.alias.sp", "leave.alias.idp"] {
        assert_eq!(cluster.group_members(group), vec![MemberId::from("a")], "{group}");
    }

    let mut ticket = nodes[1].create_tgt(UserRef::new("alice"));
    let err = nodes[1].persist(&mut ticket).await.expect_err("stopped maps reject writes");
    assert!(matches!(err, TgtError::Storage(StorageError::NotStarted)), "got: {err:?}");
    assert!(ticket.id().is_none());
}

#[tokio::test]
async fn logout_during_partition_reaches_peer_after_heal() {
    let cluster = LocalCluster::new();
    let nodes = clustered_factories(&cluster, "heal", &["a", "b"], &test_config(HOUR)).await;

    let mut ticket = nodes[0].create_tgt(UserRef::new("alice"));
    ticket.add_requestor_id("sp1");
    nodes[0].persist(&mut ticket).await.expect("persist");
    let id = ticket.id().expect("id").clone();
    nodes[0].sp_aliases().put_alias(PERSISTENT, "sp1", &id, "alias-1").await.expect("alias");

    let (b, id_ref) = (&nodes[1], &id);
    let replicated = eventually(Duration::from_secs(2), move || async move {
        matches!(b.retrieve(id_ref).await, Ok(Some(_)))
            && b.sp_aliases().get_alias(PERSISTENT, "sp1", id_ref).await.ok().flatten().is_some()
    })
    .await;
    assert!(replicated, "ticket and alias should reach b before the partition");

    cluster.partition(&MemberId::from("a"));
    ticket.expire();
    nodes[0].persist(&mut ticket).await.expect("logout on isolated node");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(b.exists(&id).await.expect("exists"), "b cannot hear a while partitioned");

    cluster.heal(&MemberId::from("a"));
    let logged_out = eventually(Duration::from_secs(2), move || async move {
        matches!(b.exists(id_ref).await, Ok(false))
            && matches!(b.sp_aliases().get_alias(PERSISTENT, "sp1", id_ref).await, Ok(None))
    })
    .await;
    assert!(logged_out, "logout made during the partition must reach b once healed");
}
