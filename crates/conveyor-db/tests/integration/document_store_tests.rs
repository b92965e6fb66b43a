use chrono::{Duration, Utc};

use conveyor_core::CoreError;
use conveyor_core::store::{Expect, MetadataStore, Order, QueryFilter, TxOp};

use crate::integration::common::setup_store;

#[tokio::test]
async fn put_get_roundtrip_with_versions() {
    let (store, _container) = setup_store().await;

    let v1 = store
        .put("jobs", "a", serde_json::json!({"state": "active"}), Expect::Absent)
        .await
        .unwrap();
    assert_eq!(v1, 1);

    let doc = store.get("jobs", "a").await.unwrap().unwrap();
    assert_eq!(doc.body["state"], "active");
    assert_eq!(doc.version, 1);

    // Same id in another collection is independent.
    assert!(store.get("executions", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn cas_rejects_stale_writers() {
    let (store, _container) = setup_store().await;

    store
        .put("jobs", "a", serde_json::json!({"n": 1}), Expect::Absent)
        .await
        .unwrap();

    let err = store
        .put("jobs", "a", serde_json::json!({"n": 2}), Expect::Absent)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let err = store
        .put("jobs", "a", serde_json::json!({"n": 2}), Expect::Version(7))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    let v2 = store
        .put("jobs", "a", serde_json::json!({"n": 2}), Expect::Version(1))
        .await
        .unwrap();
    assert_eq!(v2, 2);

    // Unconditional upsert still bumps the version.
    let v3 = store
        .put("jobs", "a", serde_json::json!({"n": 3}), Expect::Any)
        .await
        .unwrap();
    assert_eq!(v3, 3);
}

#[tokio::test]
async fn delete_with_version_check() {
    let (store, _container) = setup_store().await;

    store
        .put("jobs", "a", serde_json::json!({}), Expect::Absent)
        .await
        .unwrap();

    let err = store.delete("jobs", "a", Expect::Version(9)).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    store.delete("jobs", "a", Expect::Version(1)).await.unwrap();
    assert!(store.get("jobs", "a").await.unwrap().is_none());

    // Deleting a missing document unconditionally is a no-op.
    store.delete("jobs", "a", Expect::Any).await.unwrap();
}

#[tokio::test]
async fn transaction_commits_all_or_nothing() {
    let (store, _container) = setup_store().await;

    store
        .put("jobs", "a", serde_json::json!({"n": 1}), Expect::Absent)
        .await
        .unwrap();

    let err = store
        .transaction(vec![
            TxOp::Put {
                collection: "jobs".into(),
                id: "a".into(),
                body: serde_json::json!({"n": 2}),
                expect: Expect::Version(1),
            },
            TxOp::Put {
                collection: "executions".into(),
                id: "e".into(),
                body: serde_json::json!({}),
                expect: Expect::Version(5),
            },
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    // First op rolled back with the second.
    let doc = store.get("jobs", "a").await.unwrap().unwrap();
    assert_eq!(doc.body["n"], 1);
    assert!(store.get("executions", "e").await.unwrap().is_none());

    store
        .transaction(vec![
            TxOp::Put {
                collection: "jobs".into(),
                id: "a".into(),
                body: serde_json::json!({"n": 2}),
                expect: Expect::Version(1),
            },
            TxOp::Put {
                collection: "executions".into(),
                id: "e".into(),
                body: serde_json::json!({}),
                expect: Expect::Absent,
            },
        ])
        .await
        .unwrap();
    assert!(store.get("executions", "e").await.unwrap().is_some());
}

#[tokio::test]
async fn query_filters_orders_and_paginates() {
    let (store, _container) = setup_store().await;
    let base = Utc::now();

    for (id, tenant, offset) in [("a", "t1", 0), ("b", "t1", 1), ("c", "t2", 2), ("d", "t1", 3)] {
        let created = base + Duration::seconds(offset);
        store
            .put(
                "jobs",
                id,
                serde_json::json!({"tenant_id": tenant, "created_at": created}),
                Expect::Absent,
            )
            .await
            .unwrap();
    }

    let t1 = store
        .query(
            "jobs",
            QueryFilter::default().eq("tenant_id", "t1"),
            10,
        )
        .await
        .unwrap();
    assert_eq!(
        t1.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "d"]
    );

    // Resume after the first result.
    let rest = store
        .query(
            "jobs",
            QueryFilter {
                after: Some((base, "a".into())),
                ..QueryFilter::default().eq("tenant_id", "t1")
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(
        rest.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["b", "d"]
    );

    // Descending order and limit.
    let newest = store
        .query(
            "jobs",
            QueryFilter {
                order: Order::Desc,
                ..QueryFilter::default()
            },
            1,
        )
        .await
        .unwrap();
    assert_eq!(newest[0].id, "d");

    // Time window.
    let windowed = store
        .query(
            "jobs",
            QueryFilter {
                created_after: Some(base + Duration::seconds(1)),
                created_before: Some(base + Duration::seconds(3)),
                ..QueryFilter::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(
        windowed.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
        vec!["b", "c"]
    );
}
