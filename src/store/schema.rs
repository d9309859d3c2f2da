//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            environment TEXT NOT NULL DEFAULT 'production',
            address TEXT NOT NULL,
            imap_host TEXT NOT NULL,
            imap_port INTEGER NOT NULL DEFAULT 993,
            imap_tls INTEGER NOT NULL DEFAULT 1,
            auth_mode TEXT NOT NULL DEFAULT 'password',
            credential_ref TEXT NOT NULL DEFAULT '',
            folder TEXT NOT NULL DEFAULT 'INBOX',
            owner_id TEXT NOT NULL DEFAULT '',
            inbound_enabled INTEGER NOT NULL DEFAULT 1,
            idle_enabled INTEGER NOT NULL DEFAULT 1,
            poll_interval INTEGER NOT NULL DEFAULT 300,
            cursor TEXT,
            last_polled_at INTEGER,
            last_connection_ok_at INTEGER,
            last_connection_error TEXT,
            backoff_until INTEGER,
            backoff_secs INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_accounts_environment
         ON accounts(environment, inbound_enabled)",
    )
    .execute(pool)
    .await?;

    // Shared mutual-exclusion leases; see lease::SqliteLeaseStore
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS leases (
            key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
