//! Digest delivery: read the undelivered backlog, notify, then confirm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jad_core::{identity_of, Identity, StoredRecord};
use jad_storage::{bounded, DeliveryLease, PostingStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("digest transport failed: {0}")]
    Transport(String),
    #[error("digest notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound digest channel. Success means the recipient has the digest.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_digest(&self, records: &[StoredRecord]) -> Result<(), NotificationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Backlog empty; the notifier was not called.
    NothingPending,
    /// Another delivery, possibly in another process, holds the store's slot.
    Busy,
    Delivered { count: usize },
    /// Nothing was marked; the same records stay pending.
    NotificationFailed { pending: usize, reason: String },
    /// Notification went out but marking failed; records may be sent again.
    ConfirmFailed { pending: usize, reason: String },
    StoreUnavailable { reason: String },
}

pub struct DeliveryTracker {
    store: Arc<dyn PostingStore>,
    store_timeout: Duration,
    notify_timeout: Duration,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn PostingStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            notify_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_notify_timeout(mut self, limit: Duration) -> Self {
        self.notify_timeout = limit;
        self
    }

    /// All undelivered records, oldest insertion first.
    pub async fn pending_digest(&self) -> Result<Vec<StoredRecord>, StoreError> {
        bounded(self.store_timeout, self.store.undelivered()).await
    }

    /// Mark the given records delivered. Identities are recomputed from the
    /// postings so callers only need to hand back what they sent.
    pub async fn confirm_delivery(&self, records: &[StoredRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let identities: Vec<Identity> = records.iter().map(|r| identity_of(&r.posting)).collect();
        let marked = bounded(self.store_timeout, self.store.mark_delivered(&identities)).await?;
        info!(requested = identities.len(), marked, "delivery confirmed");
        Ok(marked)
    }

    /// One full delivery cycle under the store's delivery slot. Records are
    /// confirmed only after the notifier reports success.
    pub async fn deliver(&self, notifier: &dyn Notifier) -> DeliveryOutcome {
        let lease = match bounded(self.store_timeout, self.store.try_begin_delivery()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!("digest delivery already in progress; skipping");
                return DeliveryOutcome::Busy;
            }
            Err(err) => {
                warn!(error = %err, "could not claim the delivery slot");
                return DeliveryOutcome::StoreUnavailable {
                    reason: err.to_string(),
                };
            }
        };

        let outcome = self.deliver_leased(notifier).await;
        release(lease).await;
        outcome
    }

    async fn deliver_leased(&self, notifier: &dyn Notifier) -> DeliveryOutcome {
        let pending = match self.pending_digest().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "could not read pending digest");
                return DeliveryOutcome::StoreUnavailable {
                    reason: err.to_string(),
                };
            }
        };
        if pending.is_empty() {
            info!("no undelivered postings; digest not sent");
            return DeliveryOutcome::NothingPending;
        }

        let sent = match tokio::time::timeout(self.notify_timeout, notifier.send_digest(&pending)).await {
            Ok(result) => result,
            Err(_) => Err(NotificationError::Timeout(self.notify_timeout)),
        };
        if let Err(err) = sent {
            warn!(backlog = pending.len(), error = %err, "digest notification failed; backlog kept");
            return DeliveryOutcome::NotificationFailed {
                pending: pending.len(),
                reason: err.to_string(),
            };
        }

        match self.confirm_delivery(&pending).await {
            Ok(count) => DeliveryOutcome::Delivered { count },
            Err(err) => {
                warn!(backlog = pending.len(), error = %err, "digest sent but confirmation failed");
                DeliveryOutcome::ConfirmFailed {
                    pending: pending.len(),
                    reason: err.to_string(),
                }
            }
        }
    }
}

async fn release(lease: DeliveryLease) {
    if let Err(err) = lease.release().await {
        warn!(error = %err, "releasing the delivery slot failed");
    }
}
