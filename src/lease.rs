//! Cross-process mutual-exclusion leases.
//!
//! The lease contract (acquire-if-absent with TTL, renew, ownership
//! probe, release) is what the poll workers and the watcher fleet
//! consume; any store with an atomic set-if-absent-with-TTL can back
//! it. Two stores ship here: an in-process map for tests and
//! single-process runs, and a SQLite-backed store for multi-process
//! deployments sharing one database. Expiry is wall-clock unix
//! seconds, so a crashed holder's lease self-heals after the TTL.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Lease key for a poll pass.
pub fn poll_key(account_id: &str) -> String {
    format!("poll:{account_id}")
}

/// Lease key for an IDLE watcher.
pub fn watch_key(account_id: &str) -> String {
    format!("watch:{account_id}")
}

/// Marker key used to collapse bursts of push notifications.
pub fn debounce_key(account_id: &str) -> String {
    format!("debounce:{account_id}")
}

/// Fresh opaque identity for one runner process.
pub fn runner_token() -> String {
    format!("runner-{}", Uuid::new_v4())
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire `key` for `ttl_secs` if it is free, expired, or already
    /// held by `token`. Returns false on contention.
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool>;

    /// Extend a held lease. Returns false if `token` no longer holds it.
    async fn renew(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool>;

    /// Whether `token` currently holds an unexpired lease on `key`.
    async fn is_held_by(&self, key: &str, token: &str) -> Result<bool>;

    /// Release the lease if held by `token`; no-op otherwise.
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

/// In-process lease store.
#[derive(Default)]
pub struct MemoryLeaseStore {
    entries: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((holder, expires_at)) if *expires_at > now && holder != token => Ok(false),
            _ => {
                entries.insert(key.to_string(), (token.to_string(), now + ttl_secs));
                Ok(true)
            }
        }
    }

    async fn renew(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some((holder, expires_at)) if holder == token && *expires_at > now => {
                *expires_at = now + ttl_secs;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held_by(&self, key: &str, token: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .is_some_and(|(holder, expires_at)| holder == token && *expires_at > now))
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|(holder, _)| holder == token) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Lease store backed by the shared SQLite database.
///
/// Acquisition is a single conditional upsert, so two processes racing
/// for the same key serialize on the row.
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO leases (key, token, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                token = excluded.token,
                expires_at = excluded.expires_at
             WHERE leases.expires_at <= ? OR leases.token = excluded.token",
        )
        .bind(key)
        .bind(token)
        .bind(now + ttl_secs)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn renew(&self, key: &str, token: &str, ttl_secs: i64) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ?
             WHERE key = ? AND token = ? AND expires_at > ?",
        )
        .bind(now + ttl_secs)
        .bind(key)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_held_by(&self, key: &str, token: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM leases WHERE key = ? AND token = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(token)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
