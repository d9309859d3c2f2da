//! Durable per-mailbox synchronization state.

use sha2::{Digest, Sha256};

use super::cursor::SyncCursor;

/// How the mailbox session authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Plain LOGIN with a stored password.
    Password,
    /// XOAUTH2 with a token minted by the credential resolver.
    OAuth2,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::OAuth2 => "oauth2",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "oauth2" => AuthMode::OAuth2,
            _ => AuthMode::Password,
        }
    }
}

/// One account's durable sync state. Connection parameters are owned
/// by configuration management and read-only here; the cursor and the
/// observability fields are mutated only by the poll pass holding the
/// account's lease.
#[derive(Debug, Clone)]
pub struct AccountSyncState {
    pub account_id: String,
    pub environment: String,
    /// Display address of the mailbox (also the login username).
    pub address: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_tls: bool,
    pub auth_mode: AuthMode,
    /// Opaque reference handed to the credential resolver.
    pub credential_ref: String,
    pub folder: String,
    /// Owning identity, consulted for allow-list checks.
    pub owner_id: String,
    pub inbound_enabled: bool,
    pub idle_enabled: bool,
    /// Desired seconds between polls, before jitter and flooring.
    pub poll_interval: i64,
    pub cursor: Option<SyncCursor>,
    pub last_polled_at: Option<i64>,
    pub last_connection_ok_at: Option<i64>,
    pub last_connection_error: Option<String>,
    pub backoff_until: Option<i64>,
    /// Last applied backoff window; doubles on consecutive failures.
    pub backoff_secs: i64,
    /// Configuration recency, used for dispatcher candidate ordering.
    pub updated_at: i64,
}

impl AccountSyncState {
    /// A fresh account record with default connection settings.
    pub fn new(account_id: &str, environment: &str, address: &str, imap_host: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            environment: environment.to_string(),
            address: address.to_string(),
            imap_host: imap_host.to_string(),
            imap_port: 993,
            imap_tls: true,
            auth_mode: AuthMode::Password,
            credential_ref: String::new(),
            folder: "INBOX".to_string(),
            owner_id: String::new(),
            inbound_enabled: true,
            idle_enabled: true,
            poll_interval: 300,
            cursor: None,
            last_polled_at: None,
            last_connection_ok_at: None,
            last_connection_error: None,
            backoff_until: None,
            backoff_secs: 0,
            updated_at: 0,
        }
    }

    pub fn in_backoff(&self, now: i64) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }

    /// Hex digest of the connection parameters. Watchers capture it at
    /// start time; a mismatch on reconcile forces a reconnect.
    pub fn connection_signature(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.imap_host.as_str(),
            self.address.as_str(),
            self.credential_ref.as_str(),
            self.folder.as_str(),
            self.auth_mode.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hasher.update(self.imap_port.to_be_bytes());
        hasher.update([u8::from(self.imap_tls)]);
        format!("{:x}", hasher.finalize())
    }
}
