//! Seams to the surrounding platform.
//!
//! The sync core discovers and fetches mail; everything downstream of
//! a raw message (normalization, persistence, business logic) and
//! everything upstream of a login (credential storage, OAuth refresh)
//! belongs to external collaborators behind these traits. The shipped
//! implementations at the bottom are minimal defaults so the binary
//! runs standalone; a platform wires its own.

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::error::{IngestError, ParseError};
use crate::store::AccountSyncState;

/// Normalized form of one inbound message.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub message_id: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
}

/// Credentials resolved for one login attempt.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub username: String,
    /// Password, or a fresh OAuth2 access token for XOAUTH2.
    pub secret: String,
}

/// Turns raw message bytes into a [`NormalizedMessage`].
#[async_trait]
pub trait MessageParser: Send + Sync {
    async fn parse(&self, raw: &[u8], recipient: &str) -> Result<NormalizedMessage, ParseError>;
}

/// Hands a normalized message to the inbound pipeline. Delivery is
/// at-least-once; the sink must tolerate redundant delivery of the
/// same physical message.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn ingest(
        &self,
        account: &AccountSyncState,
        message: NormalizedMessage,
    ) -> Result<(), IngestError>;
}

/// Sender screening, consulted via the account's owning identity.
#[async_trait]
pub trait AllowListChecker: Send + Sync {
    async fn is_sender_allowed(&self, owner_id: &str, account_id: &str, address: &str) -> bool;
}

/// Resolves login credentials, including OAuth token refresh.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, account: &AccountSyncState) -> Result<SessionCredentials>;
}

// ── Shipped defaults ────────────────────────────────────────────────

/// Parser built on mail-parser: sender, subject, and the first text
/// body (or a lossy HTML fallback).
pub struct BasicMessageParser;

#[async_trait]
impl MessageParser for BasicMessageParser {
    async fn parse(&self, raw: &[u8], recipient: &str) -> Result<NormalizedMessage, ParseError> {
        let message = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError("not a parseable RFC 5322 message".to_string()))?;

        let sender = message
            .from()
            .and_then(|addrs| addrs.first())
            .and_then(|addr| addr.address())
            .map(|s| s.to_string())
            .ok_or_else(|| ParseError("missing sender address".to_string()))?;

        let text_body = message
            .body_text(0)
            .map(|s| s.to_string())
            .or_else(|| message.body_html(0).map(|s| s.to_string()))
            .unwrap_or_default();

        Ok(NormalizedMessage {
            message_id: message.message_id().map(|s| s.to_string()),
            sender,
            recipient: recipient.to_string(),
            subject: message.subject().unwrap_or_default().to_string(),
            text_body,
        })
    }
}

/// Sink that records ingestion in the log only. Stands in until the
/// platform pipeline is wired.
pub struct LogSink;

#[async_trait]
impl IngestionSink for LogSink {
    async fn ingest(
        &self,
        account: &AccountSyncState,
        message: NormalizedMessage,
    ) -> Result<(), IngestError> {
        tracing::info!(
            account = %account.account_id,
            sender = %message.sender,
            subject = %message.subject,
            "ingested message"
        );
        Ok(())
    }
}

/// Allow-list that accepts every sender.
pub struct OpenAllowList;

#[async_trait]
impl AllowListChecker for OpenAllowList {
    async fn is_sender_allowed(&self, _owner_id: &str, _account_id: &str, _address: &str) -> bool {
        true
    }
}

/// Resolver that reads the secret from the environment variable named
/// by the account's `credential_ref`.
pub struct EnvCredentialResolver;

#[async_trait]
impl CredentialResolver for EnvCredentialResolver {
    async fn resolve(&self, account: &AccountSyncState) -> Result<SessionCredentials> {
        let secret = std::env::var(&account.credential_ref).with_context(|| {
            format!(
                "credential variable '{}' not set for account {}",
                account.credential_ref, account.account_id
            )
        })?;
        Ok(SessionCredentials {
            username: account.address.clone(),
            secret,
        })
    }
}

#[cfg(test)]
pub mod stubs {
    //! Recording collaborators for tests.

    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Parser stub delegating to [`BasicMessageParser`] but countable.
    #[derive(Default)]
    pub struct StubParser {
        pub calls: Mutex<usize>,
    }

    #[async_trait]
    impl MessageParser for StubParser {
        async fn parse(&self, raw: &[u8], recipient: &str) -> Result<NormalizedMessage, ParseError> {
            *self.calls.lock().unwrap() += 1;
            BasicMessageParser.parse(raw, recipient).await
        }
    }

    /// Sink recording every ingested message.
    #[derive(Default)]
    pub struct RecordingSink {
        pub ingested: Mutex<Vec<(String, NormalizedMessage)>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingSink {
        pub fn count(&self) -> usize {
            self.ingested.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IngestionSink for RecordingSink {
        async fn ingest(
            &self,
            account: &AccountSyncState,
            message: NormalizedMessage,
        ) -> Result<(), IngestError> {
            if *self.fail.lock().unwrap() {
                return Err(IngestError("sink unavailable".to_string()));
            }
            self.ingested
                .lock()
                .unwrap()
                .push((account.account_id.clone(), message));
            Ok(())
        }
    }

    /// Allow-list rejecting a fixed set of addresses.
    #[derive(Default)]
    pub struct BlockList {
        pub blocked: HashSet<String>,
    }

    impl BlockList {
        pub fn blocking(addresses: &[&str]) -> Self {
            Self {
                blocked: addresses.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl AllowListChecker for BlockList {
        async fn is_sender_allowed(
            &self,
            _owner_id: &str,
            _account_id: &str,
            address: &str,
        ) -> bool {
            !self.blocked.contains(address)
        }
    }

    /// Fixed credentials for fake sessions.
    pub struct StaticCredentials;

    #[async_trait]
    impl CredentialResolver for StaticCredentials {
        async fn resolve(&self, account: &AccountSyncState) -> Result<SessionCredentials> {
            Ok(SessionCredentials {
                username: account.address.clone(),
                secret: "secret".to_string(),
            })
        }
    }
}
