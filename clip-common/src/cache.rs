//! # Content cache
//!
//! Fingerprint-keyed persistent cache for analyzed content records, with
//! lazy TTL expiry: an expired entry is deleted by the read that observes
//! it and reported as a miss.
//!
//! The cache is deliberately forgiving: a read failure of the backing
//! store degrades to a miss so the pipeline re-processes instead of
//! erroring. Writes report their failure to the caller, who logs and
//! moves on.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info, warn};

use crate::content::ContentRecord;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// A cached content record and the bookkeeping around it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// The analyzed content record, stored as JSONB.
    pub payload: sqlx::types::Json<ContentRecord>,
    /// Free-form scalar map: title, author, duration, worker id, etc.
    pub metadata: sqlx::types::Json<serde_json::Value>,
    /// Original URL, kept for debugging only; lookups go by fingerprint.
    pub source_url: String,
    pub locale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_hours: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A record about to be cached. TTL comes from the store's configured
/// default and is stamped onto the entry at write time.
pub struct NewCacheEntry<'a> {
    pub fingerprint: &'a str,
    pub payload: &'a ContentRecord,
    pub metadata: serde_json::Value,
    pub source_url: &'a str,
    pub locale: Option<&'a str>,
}

/// Bounded-sample cache observability numbers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_sampled: u64,
    pub expired_in_sample: u64,
    pub ttl_hours: i64,
}

/// Sample cap for [`CacheStore::stats`], to keep the query cheap.
const STATS_SAMPLE_LIMIT: usize = 1000;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Look up an entry. Expired entries are deleted and reported as a
    /// miss; store failures also degrade to a miss.
    async fn get(&self, fingerprint: &str) -> Option<CacheEntry>;

    /// Write an entry, overwriting any previous one for the fingerprint.
    async fn put(&self, entry: NewCacheEntry<'_>) -> Result<(), CacheError>;

    /// Delete an entry if present; returns whether one was deleted.
    async fn invalidate(&self, fingerprint: &str) -> Result<bool, CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;
}

/// Cache store backed by a PostgreSQL table.
pub struct PgCacheStore {
    pool: PgPool,
    table: String,
    default_ttl_hours: i64,
}

impl PgCacheStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        default_ttl_hours: i64,
    ) -> Result<Self, CacheError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| CacheError::ConnectionError { error })?;

        Ok(Self::from_pool(pool, default_ttl_hours))
    }

    pub fn from_pool(pool: PgPool, default_ttl_hours: i64) -> Self {
        Self {
            pool,
            table: "content_cache".to_owned(),
            default_ttl_hours,
        }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let base_query = format!(
            r#"
SELECT fingerprint, payload, metadata, source_url, locale, created_at, expires_at, ttl_hours
FROM "{0}"
WHERE fingerprint = $1
            "#,
            &self.table
        );

        let entry: Option<CacheEntry> = match sqlx::query_as(&base_query)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(entry) => entry,
            Err(error) => {
                warn!("cache read failed, treating as miss: {}", error);
                return None;
            }
        };

        let entry = entry?;
        if entry.is_expired(Utc::now()) {
            info!("cache EXPIRED for {}", fingerprint);
            let delete_query = format!(r#"DELETE FROM "{0}" WHERE fingerprint = $1"#, &self.table);
            if let Err(error) = sqlx::query(&delete_query)
                .bind(fingerprint)
                .execute(&self.pool)
                .await
            {
                warn!("failed to delete expired cache entry: {}", error);
            }
            return None;
        }

        info!("cache HIT for {}", fingerprint);
        Some(entry)
    }

    async fn put(&self, entry: NewCacheEntry<'_>) -> Result<(), CacheError> {
        let now = Utc::now();
        let expires_at = now + Duration::hours(self.default_ttl_hours);

        let base_query = format!(
            r#"
INSERT INTO "{0}"
    (fingerprint, payload, metadata, source_url, locale, created_at, expires_at, ttl_hours)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (fingerprint) DO UPDATE SET
    payload = EXCLUDED.payload,
    metadata = EXCLUDED.metadata,
    source_url = EXCLUDED.source_url,
    locale = EXCLUDED.locale,
    created_at = EXCLUDED.created_at,
    expires_at = EXCLUDED.expires_at,
    ttl_hours = EXCLUDED.ttl_hours
            "#,
            &self.table
        );

        sqlx::query(&base_query)
            .bind(entry.fingerprint)
            .bind(sqlx::types::Json(entry.payload))
            .bind(sqlx::types::Json(&entry.metadata))
            .bind(entry.source_url)
            .bind(entry.locale)
            .bind(now)
            .bind(expires_at)
            .bind(self.default_ttl_hours)
            .execute(&self.pool)
            .await
            .map_err(|error| CacheError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        info!(
            "cache STORED for {} (TTL: {}h)",
            entry.fingerprint, self.default_ttl_hours
        );
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &str) -> Result<bool, CacheError> {
        let base_query = format!(r#"DELETE FROM "{0}" WHERE fingerprint = $1"#, &self.table);

        let result = sqlx::query(&base_query)
            .bind(fingerprint)
            .execute(&self.pool)
            .await
            .map_err(|error| CacheError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let base_query = format!(
            r#"SELECT expires_at FROM "{0}" LIMIT {1}"#,
            &self.table, STATS_SAMPLE_LIMIT
        );

        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(&base_query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| CacheError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let now = Utc::now();
        let expired = rows.iter().filter(|(expires_at,)| now > *expires_at).count();

        Ok(CacheStats {
            total_sampled: rows.len() as u64,
            expired_in_sample: expired as u64,
            ttl_hours: self.default_ttl_hours,
        })
    }
}

/// In-memory cache store with the same expiry semantics as the Postgres
/// one. Used by the test suites and embeddable deployments.
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    default_ttl_hours: i64,
}

impl MemoryCacheStore {
    pub fn new(default_ttl_hours: i64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl_hours,
        }
    }

    /// Insert a fully-formed entry, timestamps included. Lets tests seed
    /// entries that are already expired or expire far in the future.
    pub fn insert_entry(&self, entry: CacheEntry) {
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(entry.fingerprint.clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        let entry = entries.get(fingerprint)?;
        if entry.is_expired(Utc::now()) {
            entries.remove(fingerprint);
            return None;
        }
        Some(entry.clone())
    }

    async fn put(&self, entry: NewCacheEntry<'_>) -> Result<(), CacheError> {
        let now = Utc::now();
        let stored = CacheEntry {
            fingerprint: entry.fingerprint.to_owned(),
            payload: sqlx::types::Json(entry.payload.clone()),
            metadata: sqlx::types::Json(entry.metadata),
            source_url: entry.source_url.to_owned(),
            locale: entry.locale.map(str::to_owned),
            created_at: now,
            expires_at: now + Duration::hours(self.default_ttl_hours),
            ttl_hours: self.default_ttl_hours,
        };
        self.entries
            .write()
            .expect("cache lock poisoned")
            .insert(stored.fingerprint.clone(), stored);
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .write()
            .expect("cache lock poisoned")
            .remove(fingerprint)
            .is_some())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let now = Utc::now();
        let sampled: Vec<_> = entries.values().take(STATS_SAMPLE_LIMIT).collect();
        let expired = sampled.iter().filter(|e| e.is_expired(now)).count();

        Ok(CacheStats {
            total_sampled: sampled.len() as u64,
            expired_in_sample: expired as u64,
            ttl_hours: self.default_ttl_hours,
        })
    }
}
