//! Unit tests for the SQLite fact store.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use factlog_db::DbRuntimeSettings;
use factlog_types::{Fact, FactSpec};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use crate::cancel::StatementCancel;
use crate::error::StoreError;
use crate::fact_log::{FactLog, ScanFlow, ScanRequest};
use crate::store::FactStore;

/// Opens a migrated store backed by a file in a fresh temp directory.
fn test_store() -> (TempDir, FactStore) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("facts.db");
    let store = FactStore::open(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("store should open");
    (dir, store)
}

fn scan_all(store: &FactStore, specs: &[FactSpec], after: i64, use_index: bool) -> Vec<Fact> {
    let mut seen = Vec::new();
    store
        .scan(
            ScanRequest {
                specs,
                after_serial: after,
                limit: None,
                use_index,
            },
            &StatementCancel::new(),
            &mut |fact| {
                seen.push(fact);
                ScanFlow::Continue
            },
        )
        .expect("scan should succeed");
    seen
}

fn count_facts(store: &FactStore) -> i64 {
    store
        .pool()
        .get()
        .expect("should get connection")
        .query_row("SELECT COUNT(*) FROM fact", [], |row| row.get(0))
        .expect("should count facts")
}

// ── append / publish ────────────────────────────────────────────────

#[test]
fn publish_assigns_increasing_serials() {
    let (_dir, store) = test_store();
    assert_eq!(store.highest_serial().unwrap(), 0);

    let published = store
        .publish(vec![
            Fact::new("orders", "placed"),
            Fact::new("orders", "shipped"),
            Fact::new("users", "created"),
        ])
        .expect("publish should succeed");

    let serials: Vec<i64> = published.iter().filter_map(|f| f.serial).collect();
    assert_eq!(serials, vec![1, 2, 3]);
    assert_eq!(store.highest_serial().unwrap(), 3);
}

#[test]
fn duplicate_id_rejects_whole_batch() {
    let (_dir, store) = test_store();
    let existing = Fact::new("orders", "placed");
    store.publish(vec![existing.clone()]).unwrap();

    let fresh = Fact::new("orders", "placed");
    let err = store
        .publish(vec![fresh.clone(), Fact::new("orders", "x").with_id(existing.id)])
        .expect_err("duplicate must fail");
    assert!(matches!(err, StoreError::DuplicateFact(id) if id == existing.id));
    assert_eq!(count_facts(&store), 1, "no partial append");
    assert_eq!(store.serial_of(fresh.id).unwrap(), None);

    let twin = Fact::new("users", "created");
    let err = store
        .publish(vec![twin.clone(), twin.clone()])
        .expect_err("in-batch duplicate must fail");
    assert!(matches!(err, StoreError::DuplicateFact(id) if id == twin.id));
    assert_eq!(count_facts(&store), 1);
}

#[test]
fn round_trips_every_field() {
    let (_dir, store) = test_store();
    let aggregate = Uuid::new_v4();
    let fact = Fact::new("orders", "placed")
        .with_version(3)
        .with_aggregate_id(aggregate)
        .with_meta("tenant", "acme")
        .with_payload(json!({"amount": 42}));
    store.publish(vec![fact.clone()]).unwrap();

    let read = scan_all(&store, &[FactSpec::ns("orders")], 0, true);
    assert_eq!(read.len(), 1);
    let read = &read[0];
    assert_eq!(read.id, fact.id);
    assert_eq!(read.fact_type.as_deref(), Some("placed"));
    assert_eq!(read.version, 3);
    assert!(read.aggregate_ids.contains(&aggregate));
    assert_eq!(read.meta("tenant"), Some("acme"));
    assert_eq!(read.payload, json!({"amount": 42}));
    assert_eq!(read.serial, Some(1));
}

// ── scan ────────────────────────────────────────────────────────────

#[test]
fn scan_filters_and_orders_with_and_without_index() {
    let (_dir, store) = test_store();
    let aggregate = Uuid::new_v4();
    store
        .publish(vec![
            Fact::new("orders", "placed"),
            Fact::new("users", "created"),
            Fact::new("orders", "shipped").with_aggregate_id(aggregate),
            Fact::new("orders", "placed"),
        ])
        .unwrap();

    for use_index in [true, false] {
        let serials = |specs: &[FactSpec], after| -> Vec<i64> {
            scan_all(&store, specs, after, use_index)
                .into_iter()
                .filter_map(|f| f.serial)
                .collect()
        };

        assert_eq!(serials(&[FactSpec::ns("orders")], 0), vec![1, 3, 4]);
        assert_eq!(serials(&[FactSpec::ns("orders").fact_type("placed")], 0), vec![1, 4]);
        assert_eq!(serials(&[FactSpec::ns("orders").aggregate_id(aggregate)], 0), vec![3]);
        assert_eq!(serials(&[FactSpec::ns("orders")], 1), vec![3, 4]);
        assert_eq!(
            serials(&[FactSpec::ns("users"), FactSpec::ns("orders").fact_type("shipped")], 0),
            vec![2, 3]
        );
        assert_eq!(serials(&[FactSpec::wildcard()], 0), vec![1, 2, 3, 4]);
        assert!(serials(&[], 0).is_empty());
    }
}

#[test]
fn scan_honours_limit_and_stop() {
    let (_dir, store) = test_store();
    store
        .publish((0..5).map(|_| Fact::new("x", "t")).collect())
        .unwrap();

    let mut limited = Vec::new();
    store
        .scan(
            ScanRequest {
                specs: &[FactSpec::ns("x")],
                after_serial: 0,
                limit: Some(2),
                use_index: true,
            },
            &StatementCancel::new(),
            &mut |fact| {
                limited.push(fact.serial);
                ScanFlow::Continue
            },
        )
        .unwrap();
    assert_eq!(limited, vec![Some(1), Some(2)]);

    let mut stopped = Vec::new();
    store
        .scan(
            ScanRequest {
                specs: &[FactSpec::ns("x")],
                after_serial: 0,
                limit: None,
                use_index: false,
            },
            &StatementCancel::new(),
            &mut |fact| {
                stopped.push(fact.serial);
                if stopped.len() == 3 {
                    ScanFlow::Stop
                } else {
                    ScanFlow::Continue
                }
            },
        )
        .unwrap();
    assert_eq!(stopped, vec![Some(1), Some(2), Some(3)]);
}

#[test]
fn cancelled_scan_never_starts() {
    let (_dir, store) = test_store();
    store.publish(vec![Fact::new("x", "t")]).unwrap();

    let cancel = StatementCancel::new();
    cancel.cancel();
    let mut rows = 0;
    let err = store
        .scan(
            ScanRequest {
                specs: &[FactSpec::ns("x")],
                after_serial: 0,
                limit: None,
                use_index: true,
            },
            &cancel,
            &mut |_| {
                rows += 1;
                ScanFlow::Continue
            },
        )
        .expect_err("cancelled scan must fail");
    assert!(err.is_cancellation());
    assert_eq!(rows, 0);
}

#[test]
fn serial_lookups() {
    let (_dir, store) = test_store();
    assert_eq!(store.latest_fact().unwrap(), None);

    let published = store
        .publish(vec![Fact::new("a", "t"), Fact::new("b", "t")])
        .unwrap();
    assert_eq!(store.serial_of(published[0].id).unwrap(), Some(1));
    assert_eq!(store.serial_of(Uuid::new_v4()).unwrap(), None);

    let latest = store.latest_fact().unwrap().expect("log is not empty");
    assert_eq!(latest.fact_id, published[1].id);
    assert_eq!(latest.serial, 2);
}

#[test]
fn last_matching_serial_uses_post_filters() {
    let (_dir, store) = test_store();
    store
        .publish(vec![
            Fact::new("orders", "placed").with_meta("tenant", "acme"),
            Fact::new("orders", "placed").with_meta("tenant", "other"),
            Fact::new("users", "created"),
        ])
        .unwrap();

    assert_eq!(store.serial_of_last_matching(&[FactSpec::ns("orders")]).unwrap(), 2);
    assert_eq!(
        store
            .serial_of_last_matching(&[FactSpec::ns("orders").meta("tenant", "acme")])
            .unwrap(),
        1
    );
    assert_eq!(store.serial_of_last_matching(&[FactSpec::ns("nope")]).unwrap(), 0);
    assert_eq!(store.serial_of_last_matching(&[FactSpec::wildcard()]).unwrap(), 3);
}

// ── compare-and-swap ────────────────────────────────────────────────

#[test]
fn conditional_publish_succeeds_when_unchanged() {
    let (_dir, store) = test_store();
    store.publish(vec![Fact::new("orders", "placed")]).unwrap();

    let token = store.state_for(vec![FactSpec::ns("orders")]).unwrap();
    assert_eq!(token.serial_of_last_matching_fact, 1);

    // Unrelated namespaces do not invalidate the snapshot.
    store.publish(vec![Fact::new("users", "created")]).unwrap();

    let applied = store
        .publish_if_unchanged(
            vec![Fact::new("orders", "shipped"), Fact::new("orders", "paid")],
            Some(token.token),
        )
        .unwrap();
    assert!(applied);
    assert_eq!(store.highest_serial().unwrap(), 4);
}

#[test]
fn conditional_publish_conflicts_after_matching_write() {
    let (_dir, store) = test_store();
    let token = store.state_for(vec![FactSpec::ns("orders")]).unwrap();
    assert_eq!(token.serial_of_last_matching_fact, 0);

    store.publish(vec![Fact::new("orders", "placed")]).unwrap();

    let applied = store
        .publish_if_unchanged(vec![Fact::new("orders", "shipped")], Some(token.token))
        .unwrap();
    assert!(!applied);
    assert_eq!(count_facts(&store), 1, "conflict must append nothing");
}

#[test]
fn tokens_are_single_use_and_unknown_tokens_fail() {
    let (_dir, store) = test_store();
    let token = store.state_for(vec![FactSpec::ns("orders")]).unwrap();

    assert!(store
        .publish_if_unchanged(vec![Fact::new("users", "created")], Some(token.token))
        .unwrap());
    assert!(store.state_tokens().resolve(token.token).unwrap().is_none());
    assert!(!store
        .publish_if_unchanged(vec![Fact::new("users", "created")], Some(token.token))
        .unwrap());
    assert!(!store
        .publish_if_unchanged(vec![Fact::new("users", "created")], Some(Uuid::new_v4()))
        .unwrap());
    assert!(store
        .publish_if_unchanged(vec![Fact::new("users", "created")], None)
        .unwrap());
    assert_eq!(count_facts(&store), 2);
}

#[test]
fn wildcard_token_sees_every_namespace() {
    let (_dir, store) = test_store();
    let token = store.state_for(vec![FactSpec::wildcard()]).unwrap();
    store.publish(vec![Fact::new("anything", "t")]).unwrap();

    assert!(!store
        .publish_if_unchanged(vec![Fact::new("orders", "placed")], Some(token.token))
        .unwrap());
}

#[test]
fn invalidated_and_compacted_tokens_fail_cas() {
    let (_dir, store) = test_store();

    let invalidated = store.state_for(vec![FactSpec::ns("orders")]).unwrap();
    assert!(store.invalidate(invalidated.token).unwrap());
    assert!(!store.invalidate(invalidated.token).unwrap());
    assert!(!store
        .publish_if_unchanged(vec![Fact::new("orders", "placed")], Some(invalidated.token))
        .unwrap());

    let old = store.state_for(vec![FactSpec::ns("orders")]).unwrap();
    assert_eq!(store.compact_state_tokens(Duration::days(30)).unwrap(), 0);
    let removed = store
        .state_tokens()
        .compact_created_before(Utc::now() + Duration::seconds(1))
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!store
        .publish_if_unchanged(vec![Fact::new("orders", "placed")], Some(old.token))
        .unwrap());
    assert_eq!(count_facts(&store), 0);
}

#[test]
fn resolved_token_matches_issued_token() {
    let (_dir, store) = test_store();
    let specs = vec![FactSpec::ns("orders").fact_type("placed").meta("k", "v")];
    let issued = store.state_for(specs.clone()).unwrap();
    let resolved = store
        .state_tokens()
        .resolve(issued.token)
        .unwrap()
        .expect("token should exist");
    assert_eq!(resolved.specs, specs);
    assert_eq!(resolved.serial_of_last_matching_fact, 0);
    assert_eq!(
        resolved.created_at.timestamp_micros(),
        issued.created_at.timestamp_micros()
    );
}

// ── notifications ───────────────────────────────────────────────────

#[test]
fn publish_signals_each_namespace_type_pair_once() {
    let (_dir, store) = test_store();
    let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    store.notifier().on_insert(Arc::new(move |ns, ty| {
        sink.lock()
            .unwrap()
            .push((ns.unwrap_or_default().to_string(), ty.map(str::to_string)));
    }));

    store
        .publish(vec![
            Fact::new("orders", "placed"),
            Fact::new("orders", "placed"),
            Fact::new("users", "created"),
        ])
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            ("orders".to_string(), Some("placed".to_string())),
            ("users".to_string(), Some("created".to_string())),
        ]
    );
}

#[test]
fn rejected_publish_signals_nothing() {
    let (_dir, store) = test_store();
    let signals = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&signals);
    store.notifier().on_insert(Arc::new(move |_, _| {
        *sink.lock().unwrap() += 1;
    }));

    let token = store.state_for(vec![FactSpec::ns("orders")]).unwrap();
    store.publish(vec![Fact::new("orders", "placed")]).unwrap();
    assert!(!store
        .publish_if_unchanged(vec![Fact::new("orders", "shipped")], Some(token.token))
        .unwrap());
    assert!(store.publish(vec![Fact::new("*", "bad")]).is_err());

    assert_eq!(*signals.lock().unwrap(), 1);
}
