//! IMAP access layer.
//!
//! This module is split into:
//! - `mod.rs` - Types, traits, and the XOAUTH2 authenticator
//! - `client.rs` - Connector and live session over async-imap
//!
//! Server responses are modeled as small typed results per operation
//! (status, search, header, idle event) so protocol-shape mistakes
//! surface at compile time instead of as loosely-typed maps.

pub mod client;
#[cfg(test)]
pub mod fake;

use std::time::Duration;

use async_native_tls::TlsStream;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::compat::Compat;

use crate::error::ImapError;
use crate::store::AccountSyncState;

pub use client::ImapConnector;

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        // XOAUTH2 format: "user=" + user + "\x01auth=Bearer " + token + "\x01\x01"
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

pub(crate) type ImapSession = async_imap::Session<TlsStream<Compat<TcpStream>>>;

/// Mailbox state captured when the folder was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Mailbox generation (UIDVALIDITY); changes when the mailbox is
    /// destroyed and recreated, invalidating all prior UIDs.
    pub generation: u32,
    /// Next UID the server will assign.
    pub uid_next: u32,
    /// Number of messages in the mailbox.
    pub exists: u32,
}

/// Result of a UID SEARCH the server may decline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Matching UIDs in ascending order.
    Uids(Vec<u32>),
    /// Server rejected the query; the caller picks a fallback.
    Unsupported,
}

/// Header-only view of a message, fetched without touching flags.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub uid: u32,
    pub sender: Option<String>,
}

/// Outcome of one bounded IDLE wait slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// Server signaled mailbox activity.
    NewData,
    /// The slice elapsed without server activity.
    Timeout,
}

/// One authenticated, folder-selected mailbox session.
///
/// The seam between the sync logic and the wire: the live
/// implementation wraps async-imap, tests script a fake.
#[async_trait]
pub trait MailboxSession: Send {
    /// State captured at folder selection.
    fn status(&self) -> MailboxStatus;

    /// Whether the server advertised the IDLE capability.
    fn supports_idle(&self) -> bool;

    /// `UID SEARCH UID {from}:{to} UNSEEN`; `to = None` means `*`.
    async fn search_unseen_range(
        &mut self,
        from: u32,
        to: Option<u32>,
    ) -> Result<SearchOutcome, ImapError>;

    /// Unbounded `UID SEARCH UNSEEN`.
    async fn search_unseen(&mut self) -> Result<Vec<u32>, ImapError>;

    /// Fetch headers only, without setting `\Seen`.
    async fn fetch_header(&mut self, uid: u32) -> Result<MessageHeader, ImapError>;

    /// Fetch the full raw message, without setting `\Seen`.
    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ImapError>;

    /// Mark a message `\Seen`.
    async fn mark_seen(&mut self, uid: u32) -> Result<(), ImapError>;

    /// Wait one bounded slice for server push activity.
    async fn idle_wait(&mut self, wait: Duration) -> Result<IdleEvent, ImapError>;

    /// Drop and re-issue the IDLE subscription. Long-lived watchers do
    /// this periodically to dodge server idle-session timeouts.
    async fn reset_idle(&mut self) -> Result<(), ImapError>;

    /// Best-effort logout and teardown.
    async fn close(&mut self);
}

/// Opens authenticated sessions for accounts.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(&self, account: &AccountSyncState)
    -> Result<Box<dyn MailboxSession>, ImapError>;
}
