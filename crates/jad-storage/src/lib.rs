//! Deduplication store contract + backends for JAD.
//!
//! - [`PostingStore`] - the only path to persisted postings
//! - [`MemoryStore`] - process-local backend, also the test double
//! - [`PgStore`] - Postgres backend via sqlx

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use jad_core::{Identity, Posting, StoredRecord};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "jad-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing medium failed; callers treat this as transient.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("stored record {identity} is corrupt: {reason}")]
    Corrupt { identity: String, reason: String },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub total: u64,
    pub undelivered: u64,
}

/// Exclusive right to run one delivery cycle against a store.
///
/// Dropping the lease also gives it up; [`DeliveryLease::release`] does so
/// eagerly and reports backend errors.
pub struct DeliveryLease {
    hold: LeaseHold,
}

enum LeaseHold {
    Local(OwnedMutexGuard<()>),
    /// Transaction holding `pg_try_advisory_xact_lock`; ends with it.
    Postgres(Transaction<'static, Postgres>),
}

impl DeliveryLease {
    pub(crate) fn local(guard: OwnedMutexGuard<()>) -> Self {
        Self {
            hold: LeaseHold::Local(guard),
        }
    }

    pub(crate) fn postgres(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            hold: LeaseHold::Postgres(tx),
        }
    }

    pub async fn release(self) -> Result<(), StoreError> {
        match self.hold {
            LeaseHold::Local(guard) => {
                drop(guard);
                Ok(())
            }
            LeaseHold::Postgres(tx) => {
                tx.rollback().await?;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for DeliveryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.hold {
            LeaseHold::Local(_) => "local",
            LeaseHold::Postgres(_) => "postgres",
        };
        f.debug_struct("DeliveryLease").field("kind", &kind).finish()
    }
}

/// Persistence contract for the compiled posting collection.
///
/// `upsert` is a single conditional write: for one identity, exactly one caller
/// ever observes `is_new == true`. Calls for different identities must not wait
/// on each other beyond the backend's own short critical sections.
#[async_trait]
pub trait PostingStore: Send + Sync {
    async fn exists(&self, identity: &Identity) -> Result<bool, StoreError>;

    /// Insert on first observation, otherwise refine stored fields and bump
    /// `last_seen_at`. Never touches `delivered` on an existing record. Also links
    /// the observing `posting.source_id` in the per-source view.
    async fn upsert(&self, posting: &Posting, identity: &Identity)
        -> Result<InsertResult, StoreError>;

    /// Undelivered records, oldest insertion first.
    async fn undelivered(&self) -> Result<Vec<StoredRecord>, StoreError>;

    /// Flip `delivered` to true; unknown and already delivered identities are ignored.
    /// Returns how many records actually flipped.
    async fn mark_delivered(&self, identities: &[Identity]) -> Result<usize, StoreError>;

    /// Records observed by one source, in insertion order.
    async fn records_for_source(&self, source_id: &str) -> Result<Vec<StoredRecord>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Claim the store-wide delivery slot. `None` while another holder, in this
    /// or any other process sharing the backend, still has it.
    async fn try_begin_delivery(&self) -> Result<Option<DeliveryLease>, StoreError>;
}

/// Run a store call under a caller-supplied deadline.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_maps_elapsed_deadline_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1)
        };
        let err = bounded(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(err.is_transient());

        let fast = bounded(Duration::from_secs(1), async { Ok::<_, StoreError>(7) })
            .await
            .unwrap();
        assert_eq!(fast, 7);
    }
}
