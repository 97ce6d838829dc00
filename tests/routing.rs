//! End-to-end routing tests: retry loop, targeter and in-process shards

mod common;

use common::{targeters, two_shard_catalog, Fault, InMemoryShards};
use minibulk::command::{BulkWriteRequest, NamespaceInfo, WriteOperation};
use minibulk::common::{Error, ErrorCode, RouterConfig, RouterStats};
use minibulk::execute;
use minibulk::router::{RoutingCatalog, RoutingTable};
use serde_json::json;

fn inserts(keys: &[i64]) -> Vec<WriteOperation> {
    keys.iter()
        .map(|x| WriteOperation::insert(0, json!({"_id": x, "x": x})))
        .collect()
}

fn foo_bar(ops: Vec<WriteOperation>) -> BulkWriteRequest {
    BulkWriteRequest::new(ops, vec![NamespaceInfo::new("foo.bar")])
}

#[tokio::test]
async fn test_single_insert() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    let stats = RouterStats::new();

    let request = foo_bar(inserts(&[7]));
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &stats,
    )
    .await
    .unwrap();

    assert_eq!(reply.items.len(), 1);
    assert!(reply.items[0].ok);
    assert_eq!(reply.num_errors, 0);
    assert_eq!(shards.received_shards(), vec![("shard-b".to_string(), 1)]);
    assert_eq!(shards.docs("shard-b", "foo.bar").len(), 1);
    assert_eq!(stats.requests.get(), 1);
    assert_eq!(stats.batches_sent.get(), 1);
}

#[tokio::test]
async fn test_ordered_alternating_shards() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[-1, 1, -2, 2, -3]));
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.n_total(), 5);
    let order: Vec<String> = shards.received_shards().into_iter().map(|(s, _)| s).collect();
    assert_eq!(order, vec!["shard-a", "shard-b", "shard-a", "shard-b", "shard-a"]);
}

#[tokio::test]
async fn test_unordered_alternating_shards() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[-1, 1, -2, 2, -3])).ordered(false);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.items.iter().map(|i| i.idx).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    let mut received = shards.received_shards();
    received.sort();
    assert_eq!(
        received,
        vec![("shard-a".to_string(), 3), ("shard-b".to_string(), 2)]
    );
}

#[tokio::test]
async fn test_two_namespaces_share_a_batch() {
    let catalog = two_shard_catalog();
    catalog
        .install(RoutingTable::single_shard("bar.baz", "x", "shard-a", 4))
        .unwrap();
    let shards = InMemoryShards::new(catalog.clone());

    let request = BulkWriteRequest::new(
        vec![
            WriteOperation::insert(0, json!({"x": -1})),
            WriteOperation::insert(1, json!({"x": 10})),
            WriteOperation::insert(0, json!({"x": -2})),
            WriteOperation::insert(1, json!({"x": 20})),
        ],
        vec![NamespaceInfo::new("foo.bar"), NamespaceInfo::new("bar.baz")],
    );
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar", "bar.baz"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.n_total(), 4);
    let received = shards.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].1.ops.len(), 4);
    assert_eq!(received[0].1.ns_info.len(), 2);
    assert_eq!(shards.docs("shard-a", "bar.baz").len(), 2);
}

#[tokio::test]
async fn test_stale_routing_is_refreshed_and_retried() {
    let catalog = two_shard_catalog();
    let targeters = targeters(&catalog, &["foo.bar"]);
    let shards = InMemoryShards::new(catalog.clone());
    let stats = RouterStats::new();

    // Chunk [0, +inf) moves after the targeter cached its table
    catalog.move_chunk(&"foo.bar".into(), 5, "shard-a").unwrap();

    let request = foo_bar(inserts(&[5, 6])).ordered(false);
    let reply = execute(&shards, &targeters, &request, &RouterConfig::default(), &stats)
        .await
        .unwrap();

    assert_eq!(reply.num_errors, 0);
    assert_eq!(reply.n_total(), 2);
    assert_eq!(shards.docs("shard-a", "foo.bar").len(), 2);
    assert!(shards.docs("shard-b", "foo.bar").is_empty());
    assert_eq!(stats.stale_responses.get(), 2);
    assert_eq!(stats.refreshes.get(), 1);
}

#[tokio::test]
async fn test_dropped_collection_fails_remaining_ops() {
    let catalog = two_shard_catalog();
    let targeters = targeters(&catalog, &["foo.bar"]);
    let shards = InMemoryShards::new(catalog.clone());

    catalog.drop_collection(&"foo.bar".into()).unwrap();

    let request = foo_bar(inserts(&[-1, 1, 2]));
    let reply = execute(
        &shards,
        &targeters,
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.items.len(), 3);
    assert_eq!(reply.num_errors, 3);
    assert!(reply
        .items
        .iter()
        .all(|i| i.status.as_ref().unwrap().code == ErrorCode::NamespaceDropped));
    // No round after the failed refresh
    assert_eq!(shards.received().len(), 1);
}

#[tokio::test]
async fn test_no_progress_gives_up() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.fail_always("shard-a", Fault::Stale);
    let stats = RouterStats::new();
    let config = RouterConfig {
        max_rounds_without_progress: 2,
        ..Default::default()
    };

    let request = foo_bar(inserts(&[-1]));
    let reply = execute(&shards, &targeters(&catalog, &["foo.bar"]), &request, &config, &stats)
        .await
        .unwrap();

    assert_eq!(reply.num_errors, 1);
    assert_eq!(
        reply.items[0].status.as_ref().unwrap().code,
        ErrorCode::NoProgressMade
    );
    assert_eq!(shards.received().len(), 3);
    assert_eq!(stats.no_progress_aborts.get(), 1);
}

#[tokio::test]
async fn test_ordered_halts_on_write_error() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[1, 1, 2]));
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.items.len(), 2);
    assert!(reply.items[0].ok);
    assert_eq!(
        reply.items[1].status.as_ref().unwrap().code,
        ErrorCode::DuplicateKey
    );
    assert_eq!(reply.num_errors, 1);
    assert_eq!(shards.docs("shard-b", "foo.bar").len(), 1);
}

#[tokio::test]
async fn test_unordered_continues_after_write_error() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[1, 1, 2])).ordered(false);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.items.len(), 3);
    assert_eq!(reply.num_errors, 1);
    assert!(!reply.items[1].ok);
    assert_eq!(shards.docs("shard-b", "foo.bar").len(), 2);
}

#[tokio::test]
async fn test_untargetable_insert() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    let stats = RouterStats::new();

    let ops = vec![
        WriteOperation::insert(0, json!({"x": 1})),
        WriteOperation::insert(0, json!({"y": 1})),
        WriteOperation::insert(0, json!({"x": -1})),
    ];

    let unordered = foo_bar(ops.clone()).ordered(false);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &unordered,
        &RouterConfig::default(),
        &stats,
    )
    .await
    .unwrap();
    assert_eq!(reply.items.len(), 3);
    assert_eq!(
        reply.items[1].status.as_ref().unwrap().code,
        ErrorCode::CouldNotTarget
    );
    assert_eq!(reply.n_total(), 2);
    assert_eq!(stats.target_errors.get(), 1);

    let ordered = foo_bar(ops);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &ordered,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();
    assert_eq!(reply.items.len(), 2);
    assert!(reply.items[0].ok);
    assert!(!reply.items[1].ok);
}

#[tokio::test]
async fn test_update_without_shard_key_probes_one_shard_at_a_time() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.seed("shard-b", "foo.bar", json!({"x": 4, "name": "k"}));

    let request = foo_bar(vec![WriteOperation::update(
        0,
        json!({"name": "k"}),
        json!({"$set": {"seen": true}}),
    )]);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.n_total(), 1);
    assert_eq!(
        shards.received_shards(),
        vec![("shard-a".to_string(), 1), ("shard-b".to_string(), 1)]
    );
    assert_eq!(shards.docs("shard-b", "foo.bar")[0]["seen"], json!(true));
}

#[tokio::test]
async fn test_update_without_shard_key_stops_at_first_match() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.seed("shard-a", "foo.bar", json!({"x": -4, "name": "k"}));
    shards.seed("shard-b", "foo.bar", json!({"x": 4, "name": "k"}));

    let request = foo_bar(vec![WriteOperation::update(
        0,
        json!({"name": "k"}),
        json!({"$set": {"seen": true}}),
    )]);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.n_total(), 1);
    assert_eq!(shards.received_shards(), vec![("shard-a".to_string(), 1)]);
    assert!(shards.docs("shard-b", "foo.bar")[0].get("seen").is_none());
}

#[tokio::test]
async fn test_multi_update_broadcasts() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.seed("shard-a", "foo.bar", json!({"x": -4, "name": "k"}));
    shards.seed("shard-b", "foo.bar", json!({"x": 4, "name": "k"}));

    let request = foo_bar(vec![WriteOperation::update_many(
        0,
        json!({"name": "k"}),
        json!({"$set": {"seen": true}}),
    )]);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.items.len(), 1);
    assert_eq!(reply.items[0].n, 2);
    assert_eq!(reply.items[0].n_modified, Some(2));
    assert_eq!(shards.received().len(), 2);
}

#[tokio::test]
async fn test_ordered_write_after_broadcast_waits_for_it() {
    let catalog = two_shard_catalog();
    catalog
        .install(RoutingTable::single_shard("bar.baz", "x", "shard-a", 4))
        .unwrap();
    let shards = InMemoryShards::new(catalog.clone());
    shards.seed("shard-a", "foo.bar", json!({"x": -4, "name": "k"}));
    shards.seed("shard-b", "foo.bar", json!({"x": 4, "name": "k"}));
    shards.fail_next("shard-b", Fault::Unreachable);

    let request = BulkWriteRequest::new(
        vec![
            WriteOperation::update_many(0, json!({"name": "k"}), json!({"$set": {"seen": true}})),
            WriteOperation::insert(1, json!({"x": 10})),
        ],
        vec![NamespaceInfo::new("foo.bar"), NamespaceInfo::new("bar.baz")],
    );
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar", "bar.baz"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    // The broadcast failed on shard-b, so the insert behind it never runs
    assert_eq!(reply.items.len(), 1);
    assert!(!reply.items[0].ok);
    assert_eq!(reply.num_errors, 1);
    assert!(shards.docs("shard-a", "bar.baz").is_empty());
}

#[tokio::test]
async fn test_unreachable_shard_errors_its_ops() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.fail_next("shard-b", Fault::Unreachable);
    let stats = RouterStats::new();

    let request = foo_bar(inserts(&[-1, 1, 2])).ordered(false);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &stats,
    )
    .await
    .unwrap();

    assert!(reply.items[0].ok);
    for item in &reply.items[1..] {
        let status = item.status.as_ref().unwrap();
        assert_eq!(status.code, ErrorCode::HostUnreachable);
        assert!(status.reason.contains("results unavailable from shard-b"));
    }
    assert_eq!(stats.shard_failures.get(), 1);
}

#[tokio::test]
async fn test_shutdown_aborts_request() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.fail_next("shard-a", Fault::Shutdown);

    let request = foo_bar(inserts(&[-1]));
    let err = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap_err();
    assert!(err.is_shutdown());
}

#[tokio::test]
async fn test_always_fatal_error_aborts_request() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    shards.fail_next("shard-a", Fault::Fatal);
    let stats = RouterStats::new();

    let request = foo_bar(inserts(&[-1, 1])).ordered(false).with_stmt_id(0);
    let err = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &stats,
    )
    .await
    .unwrap_err();

    match err {
        Error::AlwaysFatal(status) => {
            assert_eq!(status.code, ErrorCode::IncompleteTransactionHistory)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(stats.fatal_aborts.get(), 1);
}

#[tokio::test]
async fn test_retried_statements_are_reported() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[-1, 1, 2])).ordered(false).with_stmt_id(40);
    let first = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();
    assert!(first.retried_stmt_ids.is_empty());

    let retry = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();
    assert_eq!(retry.retried_stmt_ids, vec![40, 41, 42]);
    assert_eq!(retry.items[2].retried_stmt_id, Some(42));
    // Not applied twice
    assert_eq!(shards.docs("shard-b", "foo.bar").len(), 2);

    let sent: Vec<Option<Vec<i32>>> = shards
        .received()
        .into_iter()
        .filter(|(shard, _)| shard.as_str() == "shard-b")
        .map(|(_, r)| r.stmt_ids)
        .collect();
    assert_eq!(sent[0], Some(vec![41, 42]));
}

#[tokio::test]
async fn test_batch_op_limit_splits_rounds() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());
    let config = RouterConfig {
        max_batch_ops: 4,
        ..Default::default()
    };

    let keys: Vec<i64> = (1..=10).collect();
    let request = foo_bar(inserts(&keys)).ordered(false);
    let reply = execute(
        &shards,
        &targeters(&catalog, &["foo.bar"]),
        &request,
        &config,
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.n_total(), 10);
    let sizes: Vec<usize> = shards.received_shards().into_iter().map(|(_, n)| n).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
}

#[tokio::test]
async fn test_mismatched_targeters_rejected() {
    let catalog = two_shard_catalog();
    let shards = InMemoryShards::new(catalog.clone());

    let request = foo_bar(inserts(&[1]));
    let err = execute(&shards, &[], &request, &RouterConfig::default(), &RouterStats::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    let empty = foo_bar(vec![]);
    let err = execute(
        &shards,
        &common::targeters(&catalog, &["foo.bar"]),
        &empty,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
}

#[tokio::test]
async fn test_hashed_collection_round_trip() {
    let catalog = RoutingCatalog::from_json(
        r#"[{
            "ns": "app.users",
            "pattern": {"kind": "hashed", "field": "user"},
            "chunks": [
                {"min": null, "max": 0, "shard": "shard-a", "version": {"epoch": 2, "major": 1, "minor": 0}},
                {"min": 0, "max": null, "shard": "shard-b", "version": {"epoch": 2, "major": 1, "minor": 1}}
            ]
        }]"#,
    )
    .unwrap();
    let shards = InMemoryShards::new(catalog.clone());

    let users = ["alice", "bob", "carol", "dave", "erin", "frank"];
    let mut ops: Vec<WriteOperation> = users
        .iter()
        .map(|u| WriteOperation::insert(0, json!({"user": u})))
        .collect();
    ops.extend(users.iter().map(|u| WriteOperation::delete(0, json!({"user": u}))));
    let request = BulkWriteRequest::new(ops, vec![NamespaceInfo::new("app.users")]).ordered(false);

    let reply = execute(
        &shards,
        &targeters(&catalog, &["app.users"]),
        &request,
        &RouterConfig::default(),
        &RouterStats::new(),
    )
    .await
    .unwrap();

    assert_eq!(reply.num_errors, 0);
    assert_eq!(reply.n_total(), 12);
    assert!(shards.docs("shard-a", "app.users").is_empty());
    assert!(shards.docs("shard-b", "app.users").is_empty());
}
