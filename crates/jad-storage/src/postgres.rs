//! Postgres-backed posting store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jad_core::{Identity, NormalizedUrl, Posting, StoredRecord, Text, UNKNOWN};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{DeliveryLease, InsertResult, PostingStore, StoreError, StoreStats};

/// Advisory lock key serializing digest delivery across processes ("jad_dlvr").
const DELIVERY_LOCK_KEY: i64 = 0x6a61_645f_646c_7672;

const RECORD_COLUMNS: &str = "p.identity, p.seq, p.source_id, p.title, p.company, p.location, \
     p.url, p.posted_at, p.extra, p.delivered, p.first_seen_at, p.last_seen_at";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unavailable(format!("migration failed: {err}"))
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<StoredRecord, StoreError> {
    let identity: String = row.try_get("identity")?;
    let url: String = row.try_get("url")?;
    let url = NormalizedUrl::parse(&url).map_err(|err| StoreError::Corrupt {
        identity: identity.clone(),
        reason: err.to_string(),
    })?;
    let extra: Json<Map<String, JsonValue>> = row.try_get("extra")?;
    let posted_at: Option<NaiveDate> = row.try_get("posted_at")?;
    let first_seen_at: DateTime<Utc> = row.try_get("first_seen_at")?;
    let last_seen_at: DateTime<Utc> = row.try_get("last_seen_at")?;

    Ok(StoredRecord {
        identity: Identity::from_hex(identity),
        sequence: row.try_get("seq")?,
        posting: Posting {
            source_id: row.try_get("source_id")?,
            title: Text::from(row.try_get::<String, _>("title")?),
            company: Text::from(row.try_get::<String, _>("company")?),
            location: Text::from(row.try_get::<String, _>("location")?),
            url,
            posted_at,
            extra: extra.0,
        },
        delivered: row.try_get("delivered")?,
        first_seen_at,
        last_seen_at,
    })
}

#[async_trait]
impl PostingStore for PgStore {
    async fn exists(&self, identity: &Identity) -> Result<bool, StoreError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM postings WHERE identity = $1)")
                .bind(identity.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn upsert(
        &self,
        posting: &Posting,
        identity: &Identity,
    ) -> Result<InsertResult, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // xmax is zero only for a row this statement inserted.
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO postings (identity, source_id, title, company, location, url,
                                  posted_at, extra, delivered, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9, $9)
            ON CONFLICT (identity) DO UPDATE SET
                title = CASE WHEN EXCLUDED.title = $10 THEN postings.title ELSE EXCLUDED.title END,
                company = CASE WHEN EXCLUDED.company = $10 THEN postings.company ELSE EXCLUDED.company END,
                location = CASE WHEN EXCLUDED.location = $10 THEN postings.location ELSE EXCLUDED.location END,
                posted_at = COALESCE(EXCLUDED.posted_at, postings.posted_at),
                extra = postings.extra || EXCLUDED.extra,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(identity.as_str())
        .bind(&posting.source_id)
        .bind(posting.title.as_str())
        .bind(posting.company.as_str())
        .bind(posting.location.as_str())
        .bind(posting.url.as_str())
        .bind(posting.posted_at)
        .bind(Json(&posting.extra))
        .bind(now)
        .bind(UNKNOWN)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO source_postings (source_id, identity, linked_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id, identity) DO NOTHING
            "#,
        )
        .bind(&posting.source_id)
        .bind(identity.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(identity = %identity, inserted, "posting upserted");
        Ok(InsertResult { is_new: inserted })
    }

    async fn undelivered(&self) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM postings p WHERE NOT p.delivered ORDER BY p.seq"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn mark_delivered(&self, identities: &[Identity]) -> Result<usize, StoreError> {
        if identities.is_empty() {
            return Ok(0);
        }
        let keys = identities
            .iter()
            .map(|identity| identity.as_str().to_string())
            .collect::<Vec<_>>();
        let result = sqlx::query(
            "UPDATE postings SET delivered = TRUE WHERE identity = ANY($1) AND NOT delivered",
        )
        .bind(&keys)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn records_for_source(&self, source_id: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM postings p \
             JOIN source_postings sp ON sp.identity = p.identity \
             WHERE sp.source_id = $1 ORDER BY p.seq"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE NOT delivered) AS undelivered FROM postings",
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let undelivered: i64 = row.try_get("undelivered")?;
        Ok(StoreStats {
            total: total.max(0) as u64,
            undelivered: undelivered.max(0) as u64,
        })
    }

    async fn try_begin_delivery(&self) -> Result<Option<DeliveryLease>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(DELIVERY_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if acquired {
            Ok(Some(DeliveryLease::postgres(tx)))
        } else {
            tx.rollback().await?;
            debug!("delivery lock held elsewhere");
            Ok(None)
        }
    }
}
