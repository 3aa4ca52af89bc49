//! Process-local store, also used as the test double for the Postgres backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jad_core::{Identity, Posting, StoredRecord};
use tokio::sync::Mutex;

use crate::{DeliveryLease, InsertResult, PostingStore, StoreError, StoreStats};

/// Identities one source has observed, in link order.
#[derive(Debug, Default)]
struct SourceLinks {
    order: Vec<Identity>,
    seen: HashSet<Identity>,
}

impl SourceLinks {
    fn link(&mut self, identity: &Identity) {
        if self.seen.insert(identity.clone()) {
            self.order.push(identity.clone());
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<Identity, StoredRecord>,
    by_source: BTreeMap<String, SourceLinks>,
    next_sequence: i64,
}

/// In-memory posting store.
///
/// All state sits behind one `tokio::sync::Mutex`; every operation holds it for
/// a short synchronous section only, so check-and-insert is atomic per call.
/// Cloning yields another handle to the **same** records and delivery slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    delivery_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.records.is_empty()
    }

    pub async fn get(&self, identity: &Identity) -> Option<StoredRecord> {
        self.state.lock().await.records.get(identity).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

fn ordered(mut records: Vec<StoredRecord>) -> Vec<StoredRecord> {
    records.sort_by_key(|r| r.sequence);
    records
}

#[async_trait]
impl PostingStore for MemoryStore {
    async fn exists(&self, identity: &Identity) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.records.contains_key(identity))
    }

    async fn upsert(
        &self,
        posting: &Posting,
        identity: &Identity,
    ) -> Result<InsertResult, StoreError> {
        self.check_available()?;
        let mut guard = self.state.lock().await;
        let now = Utc::now();
        let state = &mut *guard;

        let is_new = match state.records.get_mut(identity) {
            Some(existing) => {
                existing.posting.refine_with(posting);
                existing.last_seen_at = now;
                false
            }
            None => {
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state.records.insert(
                    identity.clone(),
                    StoredRecord {
                        identity: identity.clone(),
                        sequence,
                        posting: posting.clone(),
                        delivered: false,
                        first_seen_at: now,
                        last_seen_at: now,
                    },
                );
                true
            }
        };

        state
            .by_source
            .entry(posting.source_id.clone())
            .or_default()
            .link(identity);

        Ok(InsertResult { is_new })
    }

    async fn undelivered(&self) -> Result<Vec<StoredRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(ordered(
            state
                .records
                .values()
                .filter(|r| !r.delivered)
                .cloned()
                .collect(),
        ))
    }

    async fn mark_delivered(&self, identities: &[Identity]) -> Result<usize, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let mut flipped = 0;
        for identity in identities {
            if let Some(record) = state.records.get_mut(identity) {
                if !record.delivered {
                    record.delivered = true;
                    flipped += 1;
                }
            }
        }
        Ok(flipped)
    }

    async fn records_for_source(&self, source_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let Some(linked) = state.by_source.get(source_id) else {
            return Ok(Vec::new());
        };
        Ok(ordered(
            linked
                .order
                .iter()
                .filter_map(|identity| state.records.get(identity).cloned())
                .collect(),
        ))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let undelivered = state.records.values().filter(|r| !r.delivered).count();
        Ok(StoreStats {
            total: state.records.len() as u64,
            undelivered: undelivered as u64,
        })
    }

    async fn try_begin_delivery(&self) -> Result<Option<DeliveryLease>, StoreError> {
        self.check_available()?;
        Ok(Arc::clone(&self.delivery_lock)
            .try_lock_owned()
            .ok()
            .map(DeliveryLease::local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jad_core::{identity_of, normalize, RawPosting};
    use serde_json::json;

    fn posting(source_id: &str, value: serde_json::Value) -> Posting {
        let raw: RawPosting = value.as_object().cloned().expect("object");
        normalize(&raw, source_id).expect("valid posting")
    }

    #[tokio::test]
    async fn first_upsert_is_new_and_second_is_not() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/1", "title": "X"}));
        let id = identity_of(&p);

        assert!(!store.exists(&id).await.unwrap());
        assert!(store.upsert(&p, &id).await.unwrap().is_new);
        assert!(store.exists(&id).await.unwrap());

        let first = store.get(&id).await.unwrap();
        assert!(!store.upsert(&p, &id).await.unwrap().is_new);
        let second = store.get(&id).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(first.first_seen_at, second.first_seen_at);
        assert!(second.last_seen_at >= first.last_seen_at);
        assert!(!second.delivered);
    }

    #[tokio::test]
    async fn reobservation_refines_without_erasing() {
        let store = MemoryStore::new();
        let full = posting(
            "a",
            json!({"url": "https://s/1", "title": "Designer", "company": "ACME", "location": "London"}),
        );
        let sparse = posting("b", json!({"url": "https://s/1/", "title": "Product Designer"}));
        let id = identity_of(&full);

        store.upsert(&full, &id).await.unwrap();
        store.upsert(&sparse, &id).await.unwrap();

        let stored = store.get(&id).await.unwrap().posting;
        assert_eq!(stored.title.as_str(), "Product Designer");
        assert_eq!(stored.company.as_str(), "ACME");
        assert_eq!(stored.location.as_str(), "London");
        assert_eq!(stored.source_id, "a");
    }

    #[tokio::test]
    async fn upsert_leaves_delivered_flag_alone() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/1"}));
        let id = identity_of(&p);
        store.upsert(&p, &id).await.unwrap();
        assert_eq!(store.mark_delivered(&[id.clone()]).await.unwrap(), 1);

        assert!(!store.upsert(&p, &id).await.unwrap().is_new);
        assert!(store.get(&id).await.unwrap().delivered);
        assert!(store.undelivered().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undelivered_is_oldest_first() {
        let store = MemoryStore::new();
        for n in [3, 1, 2] {
            let p = posting("a", json!({"url": format!("https://s/{n}")}));
            store.upsert(&p, &identity_of(&p)).await.unwrap();
        }
        let urls = store
            .undelivered()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.posting.url.to_string())
            .collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://s/3", "https://s/1", "https://s/2"]);
    }

    #[tokio::test]
    async fn mark_delivered_is_idempotent_and_ignores_unknown() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/1"}));
        let id = identity_of(&p);
        store.upsert(&p, &id).await.unwrap();

        let ghost = jad_core::identity_for_url("https://s/ghost").unwrap();
        assert_eq!(store.mark_delivered(&[id.clone(), ghost.clone()]).await.unwrap(), 1);
        assert_eq!(store.mark_delivered(&[id.clone(), ghost]).await.unwrap(), 0);
        assert!(!store.exists(&jad_core::identity_for_url("https://s/ghost").unwrap()).await.unwrap());
        assert_eq!(
            store.stats().await.unwrap(),
            StoreStats {
                total: 1,
                undelivered: 0
            }
        );
    }

    #[tokio::test]
    async fn concurrent_upserts_of_one_identity_report_new_once() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/race"}));
        let id = identity_of(&p);

        let mut handles = Vec::new();
        for _ in 0..64 {
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
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn per_source_view_links_every_observer() {
        let store = MemoryStore::new();
        let from_a = posting("a", json!({"url": "https://s/1"}));
        let from_b = posting("b", json!({"url": "https://s/1"}));
        let only_b = posting("b", json!({"url": "https://s/2"}));
        store.upsert(&from_a, &identity_of(&from_a)).await.unwrap();
        store.upsert(&from_b, &identity_of(&from_b)).await.unwrap();
        store.upsert(&only_b, &identity_of(&only_b)).await.unwrap();

        assert_eq!(store.records_for_source("a").await.unwrap().len(), 1);
        assert_eq!(store.records_for_source("b").await.unwrap().len(), 2);
        assert!(store.records_for_source("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_observations_link_once_in_first_seen_order() {
        let store = MemoryStore::new();
        let first = posting("a", json!({"url": "https://s/1"}));
        let second = posting("a", json!({"url": "https://s/2"}));
        for _ in 0..3 {
            store.upsert(&first, &identity_of(&first)).await.unwrap();
            store.upsert(&second, &identity_of(&second)).await.unwrap();
        }

        let urls: Vec<String> = store
            .records_for_source("a")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.posting.url.to_string())
            .collect();
        assert_eq!(urls, vec!["https://s/1", "https://s/2"]);
    }

    #[tokio::test]
    async fn racing_reobservations_never_move_last_seen_backwards() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/1"}));
        let id = identity_of(&p);
        store.upsert(&p, &id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            let p = p.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&p, &id).await.unwrap();
                store.get(&id).await.unwrap().last_seen_at
            }));
        }
        let mut latest_observed = None;
        for handle in handles {
            let seen = handle.await.unwrap();
            latest_observed = latest_observed.max(Some(seen));
        }

        let stored = store.get(&id).await.unwrap().last_seen_at;
        assert_eq!(Some(stored), latest_observed);
    }

    #[tokio::test]
    async fn delivery_slot_is_shared_by_every_handle() {
        let store = MemoryStore::new();
        let other_handle = store.clone();

        let lease = store.try_begin_delivery().await.unwrap().expect("free slot");
        assert!(other_handle.try_begin_delivery().await.unwrap().is_none());

        lease.release().await.unwrap();
        let again = other_handle.try_begin_delivery().await.unwrap();
        assert!(again.is_some());
        drop(again);
        assert!(store.try_begin_delivery().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn switched_off_store_fails_without_writing() {
        let store = MemoryStore::new();
        let p = posting("a", json!({"url": "https://s/1"}));
        let id = identity_of(&p);

        store.set_unavailable(true);
        let err = store.upsert(&p, &id).await.unwrap_err();
        assert!(err.is_transient());

        store.set_unavailable(false);
        assert!(store.is_empty().await);
        assert!(store.upsert(&p, &id).await.unwrap().is_new);
    }
}
