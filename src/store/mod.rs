//! SQLite-backed account store.
//!
//! Holds the durable [`AccountSyncState`] rows shared by the
//! dispatcher, the poll workers, and the watcher fleet. The cursor and
//! observability fields of a row are written only by the poll pass
//! holding that account's lease.

mod account;
pub mod cursor;
mod schema;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

pub use account::{AccountSyncState, AuthMode};
pub use cursor::SyncCursor;

use crate::constants::{BACKOFF_BASE_SECS, BACKOFF_CAP_SECS};

/// Connection pool size - sized for concurrent poll passes and
/// reconcile queries in one process.
const POOL_SIZE: u32 = 16;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("Failed to create connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace an account's configuration. Sync state columns
    /// of an existing row are preserved.
    pub async fn upsert_account(&self, account: &AccountSyncState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
                account_id, environment, address, imap_host, imap_port,
                imap_tls, auth_mode, credential_ref, folder, owner_id,
                inbound_enabled, idle_enabled, poll_interval, cursor,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                environment = excluded.environment,
                address = excluded.address,
                imap_host = excluded.imap_host,
                imap_port = excluded.imap_port,
                imap_tls = excluded.imap_tls,
                auth_mode = excluded.auth_mode,
                credential_ref = excluded.credential_ref,
                folder = excluded.folder,
                owner_id = excluded.owner_id,
                inbound_enabled = excluded.inbound_enabled,
                idle_enabled = excluded.idle_enabled,
                poll_interval = excluded.poll_interval,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.environment)
        .bind(&account.address)
        .bind(&account.imap_host)
        .bind(i64::from(account.imap_port))
        .bind(i64::from(account.imap_tls))
        .bind(account.auth_mode.as_str())
        .bind(&account.credential_ref)
        .bind(&account.folder)
        .bind(&account.owner_id)
        .bind(i64::from(account.inbound_enabled))
        .bind(i64::from(account.idle_enabled))
        .bind(account.poll_interval)
        .bind(account.cursor.as_ref().map(SyncCursor::encode))
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<AccountSyncState>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_account(&r)).transpose()
    }

    /// Candidate set for one dispatcher tick: this environment's
    /// accounts, most recently configured first, bounded.
    pub async fn poll_candidates(
        &self,
        environment: &str,
        limit: usize,
    ) -> Result<Vec<AccountSyncState>> {
        let rows = sqlx::query(
            "SELECT * FROM accounts
             WHERE environment = ? AND inbound_enabled = 1
             ORDER BY updated_at DESC
             LIMIT ?",
        )
        .bind(environment)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    /// Accounts eligible for an IDLE watcher in this environment.
    pub async fn idle_eligible(&self, environment: &str) -> Result<Vec<AccountSyncState>> {
        let rows = sqlx::query(
            "SELECT * FROM accounts
             WHERE environment = ? AND inbound_enabled = 1 AND idle_enabled = 1
             ORDER BY updated_at DESC",
        )
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    /// Commit the result of a successful (or partially successful)
    /// pass: cursor, poll timestamps, and error/backoff reset in one
    /// durable update.
    pub async fn commit_pass(
        &self,
        account_id: &str,
        cursor: Option<&SyncCursor>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE accounts SET
                cursor = COALESCE(?, cursor),
                last_polled_at = ?,
                last_connection_ok_at = ?,
                last_connection_error = NULL,
                backoff_until = NULL,
                backoff_secs = 0
             WHERE account_id = ?",
        )
        .bind(cursor.map(SyncCursor::encode))
        .bind(now)
        .bind(now)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a connection-level failure: store the error and extend
    /// the backoff window (base doubling, capped). Returns the new
    /// `backoff_until`. All expressions read the pre-update row, so the
    /// doubling is atomic under concurrent readers.
    pub async fn record_failure(&self, account_id: &str, error: &str, now: i64) -> Result<i64> {
        sqlx::query(
            "UPDATE accounts SET
                last_connection_error = ?,
                last_polled_at = ?,
                backoff_until = ? + MIN(MAX(backoff_secs * 2, ?), ?),
                backoff_secs = MIN(MAX(backoff_secs * 2, ?), ?)
             WHERE account_id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(BACKOFF_BASE_SECS)
        .bind(BACKOFF_CAP_SECS)
        .bind(BACKOFF_BASE_SECS)
        .bind(BACKOFF_CAP_SECS)
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        let until: Option<i64> =
            sqlx::query_scalar("SELECT backoff_until FROM accounts WHERE account_id = ?")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(until.unwrap_or(now))
    }
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<AccountSyncState> {
    let cursor = row
        .try_get::<Option<String>, _>("cursor")?
        .as_deref()
        .and_then(SyncCursor::parse);

    Ok(AccountSyncState {
        account_id: row.try_get("account_id")?,
        environment: row.try_get("environment")?,
        address: row.try_get("address")?,
        imap_host: row.try_get("imap_host")?,
        imap_port: row.try_get::<i64, _>("imap_port")? as u16,
        imap_tls: row.try_get::<i64, _>("imap_tls")? != 0,
        auth_mode: AuthMode::parse(&row.try_get::<String, _>("auth_mode")?),
        credential_ref: row.try_get("credential_ref")?,
        folder: row.try_get("folder")?,
        owner_id: row.try_get("owner_id")?,
        inbound_enabled: row.try_get::<i64, _>("inbound_enabled")? != 0,
        idle_enabled: row.try_get::<i64, _>("idle_enabled")? != 0,
        poll_interval: row.try_get("poll_interval")?,
        cursor,
        last_polled_at: row.try_get("last_polled_at")?,
        last_connection_ok_at: row.try_get("last_connection_ok_at")?,
        last_connection_error: row.try_get("last_connection_error")?,
        backoff_until: row.try_get("backoff_until")?,
        backoff_secs: row.try_get("backoff_secs")?,
        updated_at: row.try_get("updated_at")?,
    })
}
