//! Runs only when `JAD_TEST_DATABASE_URL` points at a disposable database.
//! The tables are truncated first.

use std::sync::Arc;

use jad_core::{identity_of, normalize, Posting, RawPosting};
use jad_storage::{PgStore, PostingStore};
use serde_json::json;

fn posting(source_id: &str, value: serde_json::Value) -> Posting {
    let raw: RawPosting = value.as_object().cloned().expect("object");
    normalize(&raw, source_id).expect("valid posting")
}

async fn test_store() -> Option<PgStore> {
    let url = std::env::var("JAD_TEST_DATABASE_URL").ok()?;
    let store = PgStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    sqlx::query("TRUNCATE source_postings, postings RESTART IDENTITY")
        .execute(store.pool())
        .await
        .expect("truncate");
    Some(store)
}

#[tokio::test]
async fn postgres_store_honours_the_store_contract() {
    let Some(store) = test_store().await else {
        eprintln!("JAD_TEST_DATABASE_URL not set; skipping");
        return;
    };

    let first = posting(
        "a",
        json!({"url": "https://s/1", "title": "Designer", "company": "ACME", "salary": "40k"}),
    );
    let id = identity_of(&first);
    assert!(!store.exists(&id).await.unwrap());
    assert!(store.upsert(&first, &id).await.unwrap().is_new);

    let before = store.undelivered().await.unwrap();
    let sparse = posting("b", json!({"url": "https://s/1/?utm_source=x", "title": "Product Designer"}));
    assert!(!store.upsert(&sparse, &identity_of(&sparse)).await.unwrap().is_new);

    let after = store.undelivered().await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].first_seen_at, before[0].first_seen_at);
    assert_eq!(after[0].posting.title.as_str(), "Product Designer");
    assert_eq!(after[0].posting.company.as_str(), "ACME");
    assert_eq!(after[0].posting.extra.get("salary"), Some(&json!("40k")));
    assert_eq!(store.records_for_source("b").await.unwrap().len(), 1);

    let second = posting("a", json!({"url": "https://s/2"}));
    store.upsert(&second, &identity_of(&second)).await.unwrap();
    let order = store
        .undelivered()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.posting.url.to_string())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["https://s/1", "https://s/2"]);

    assert_eq!(store.mark_delivered(&[id.clone()]).await.unwrap(), 1);
    assert_eq!(store.mark_delivered(&[id.clone()]).await.unwrap(), 0);
    store.upsert(&first, &id).await.unwrap();
    let pending = store.undelivered().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].posting.url.as_str(), "https://s/2");

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.undelivered, 1);

    // Concurrent observations of one new posting insert exactly once.
    let store = Arc::new(store);
    let p = posting("race", json!({"url": "https://s/race"}));
    let id = identity_of(&p);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        let p = p.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { store.upsert(&p, &id).await.unwrap() }));
    }
    let mut new_count = 0;
    for handle in handles {
        if handle.await.unwrap().is_new {
            new_count += 1;
        }
    }
    assert_eq!(new_count, 1);

    // The delivery slot is exclusive across independent pools, as between processes.
    let url = std::env::var("JAD_TEST_DATABASE_URL").expect("set when a store was returned");
    let other_process = PgStore::connect(&url).await.expect("second pool");
    let lease = store.try_begin_delivery().await.unwrap().expect("free slot");
    assert!(other_process.try_begin_delivery().await.unwrap().is_none());
    lease.release().await.unwrap();
    let lease = other_process.try_begin_delivery().await.unwrap().expect("released slot");
    lease.release().await.unwrap();
}
