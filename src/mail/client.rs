//! Live IMAP connector and session over async-imap.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::constants::IMAP_OP_TIMEOUT_SECS;
use crate::error::ImapError;
use crate::ingest::CredentialResolver;
use crate::store::{AccountSyncState, AuthMode};

use super::{
    IdleEvent, ImapSession, MailboxConnector, MailboxSession, MailboxStatus, MessageHeader,
    SearchOutcome, XOAuth2Authenticator,
};

type IdleHandle = async_imap::extensions::idle::Handle<
    async_native_tls::TlsStream<tokio_util::compat::Compat<TcpStream>>,
>;

/// Bound every network round trip; a wedged server must not stall a
/// pass or a watcher indefinitely.
async fn op<T>(fut: impl Future<Output = Result<T, ImapError>>) -> Result<T, ImapError> {
    match tokio::time::timeout(Duration::from_secs(IMAP_OP_TIMEOUT_SECS), fut).await {
        Ok(result) => result,
        Err(_) => Err(ImapError::Timeout),
    }
}

fn imap_error(e: async_imap::error::Error) -> ImapError {
    use async_imap::error::Error;
    match e {
        Error::Io(err) => ImapError::Connect(err.to_string()),
        Error::ConnectionLost => ImapError::Connect("connection lost".to_string()),
        other => ImapError::Protocol(format!("{other:?}")),
    }
}

fn extract_sender(raw_header: &[u8]) -> Option<String> {
    let message = mail_parser::MessageParser::default().parse(raw_header)?;
    message
        .from()
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address())
        .map(|s| s.to_string())
}

/// Opens TLS + authenticated sessions using resolved credentials.
pub struct ImapConnector {
    resolver: Arc<dyn CredentialResolver>,
}

impl ImapConnector {
    pub fn new(resolver: Arc<dyn CredentialResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn open(
        &self,
        account: &AccountSyncState,
    ) -> Result<Box<dyn MailboxSession>, ImapError> {
        if !account.imap_tls {
            return Err(ImapError::Connect(
                "plaintext sessions are not supported by the built-in connector".to_string(),
            ));
        }

        let credentials = self
            .resolver
            .resolve(account)
            .await
            .map_err(|e| ImapError::Auth(e.to_string()))?;

        let addr = format!("{}:{}", account.imap_host, account.imap_port);
        let tcp = op(async {
            TcpStream::connect(&addr)
                .await
                .map_err(|e| ImapError::Connect(format!("{addr}: {e}")))
        })
        .await?;

        // Wrap tokio stream with compat layer for futures-io compatibility
        let tcp_compat = tcp.compat();

        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = op(async {
            tls.connect(&account.imap_host, tcp_compat)
                .await
                .map_err(|e| ImapError::Connect(format!("TLS handshake failed: {e}")))
        })
        .await?;

        let client = async_imap::Client::new(tls_stream);

        let mut session = match account.auth_mode {
            AuthMode::Password => op(async {
                client
                    .login(&credentials.username, &credentials.secret)
                    .await
                    .map_err(|e| ImapError::Auth(format!("{:?}", e.0)))
            })
            .await?,
            AuthMode::OAuth2 => {
                let authenticator = XOAuth2Authenticator {
                    user: credentials.username.clone(),
                    access_token: credentials.secret.clone(),
                };
                op(async {
                    client
                        .authenticate("XOAUTH2", authenticator)
                        .await
                        .map_err(|e| ImapError::Auth(format!("{:?}", e.0)))
                })
                .await?
            }
        };

        let supports_idle = match op(async {
            session.capabilities().await.map_err(imap_error)
        })
        .await
        {
            Ok(caps) => caps.has(&async_imap::types::Capability::Atom("IDLE".into())),
            Err(e) => {
                tracing::debug!(account = %account.account_id, "capability check failed: {e}");
                false
            }
        };

        // Read-write select; messages are marked seen after ingestion
        let mailbox = op(async {
            session.select(&account.folder).await.map_err(imap_error)
        })
        .await
        .map_err(|e| match e {
            ImapError::Protocol(_) => ImapError::FolderNotFound(account.folder.clone()),
            other => other,
        })?;

        let status = MailboxStatus {
            generation: mailbox.uid_validity.unwrap_or(0),
            uid_next: mailbox.uid_next.unwrap_or(1),
            exists: mailbox.exists,
        };

        tracing::debug!(
            account = %account.account_id,
            generation = status.generation,
            uid_next = status.uid_next,
            exists = status.exists,
            supports_idle,
            "mailbox session opened"
        );

        Ok(Box::new(ImapMailbox {
            session: Some(session),
            idle: None,
            status,
            supports_idle,
        }))
    }
}

/// A live, folder-selected session.
pub struct ImapMailbox {
    session: Option<ImapSession>,
    idle: Option<IdleHandle>,
    status: MailboxStatus,
    supports_idle: bool,
}

impl ImapMailbox {
    fn session_mut(&mut self) -> Result<&mut ImapSession, ImapError> {
        self.session.as_mut().ok_or(ImapError::NotConnected)
    }

    async fn ensure_idle(&mut self) -> Result<(), ImapError> {
        if self.idle.is_some() {
            return Ok(());
        }
        let session = self.session.take().ok_or(ImapError::NotConnected)?;
        let mut handle = session.idle();
        if let Err(e) = op(async { handle.init().await.map_err(imap_error) }).await {
            // Recover the session if DONE still round-trips
            if let Ok(session) = handle.done().await {
                self.session = Some(session);
            }
            return Err(e);
        }
        self.idle = Some(handle);
        Ok(())
    }

    /// End IDLE and hand the session back for regular commands.
    async fn leave_idle(&mut self) -> Result<(), ImapError> {
        if let Some(handle) = self.idle.take() {
            let session = op(async { handle.done().await.map_err(imap_error) }).await?;
            self.session = Some(session);
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxSession for ImapMailbox {
    fn status(&self) -> MailboxStatus {
        self.status
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn search_unseen_range(
        &mut self,
        from: u32,
        to: Option<u32>,
    ) -> Result<SearchOutcome, ImapError> {
        self.leave_idle().await?;
        let session = self.session_mut()?;
        let query = match to {
            Some(to) => format!("UID {from}:{to} UNSEEN"),
            None => format!("UID {from}:* UNSEEN"),
        };

        match op(async { Ok(session.uid_search(&query).await) }).await? {
            Ok(uids) => {
                let mut uids: Vec<u32> = uids.into_iter().collect();
                uids.sort_unstable();
                Ok(SearchOutcome::Uids(uids))
            }
            Err(e) => match e {
                async_imap::error::Error::Io(err) => Err(ImapError::Connect(err.to_string())),
                async_imap::error::Error::ConnectionLost => {
                    Err(ImapError::Connect("connection lost".to_string()))
                }
                other => {
                    tracing::debug!("server declined '{query}': {other:?}");
                    Ok(SearchOutcome::Unsupported)
                }
            },
        }
    }

    async fn search_unseen(&mut self) -> Result<Vec<u32>, ImapError> {
        self.leave_idle().await?;
        let session = self.session_mut()?;
        let uids = op(async { session.uid_search("UNSEEN").await.map_err(imap_error) }).await?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_header(&mut self, uid: u32) -> Result<MessageHeader, ImapError> {
        self.leave_idle().await?;
        let session = self.session_mut()?;
        op(async {
            let mut stream = session
                .uid_fetch(uid.to_string(), "(UID BODY.PEEK[HEADER])")
                .await
                .map_err(imap_error)?;

            let mut header = None;
            while let Some(item) = stream.next().await {
                let fetch = item.map_err(imap_error)?;
                if fetch.uid == Some(uid) {
                    header = Some(MessageHeader {
                        uid,
                        sender: fetch.header().and_then(extract_sender),
                    });
                }
            }
            header.ok_or_else(|| ImapError::Protocol(format!("no FETCH response for uid {uid}")))
        })
        .await
    }

    async fn fetch_raw(&mut self, uid: u32) -> Result<Vec<u8>, ImapError> {
        self.leave_idle().await?;
        let session = self.session_mut()?;
        op(async {
            let mut stream = session
                .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
                .await
                .map_err(imap_error)?;

            let mut body = None;
            while let Some(item) = stream.next().await {
                let fetch = item.map_err(imap_error)?;
                if fetch.uid == Some(uid)
                    && let Some(bytes) = fetch.body()
                {
                    body = Some(bytes.to_vec());
                }
            }
            body.ok_or_else(|| ImapError::Protocol(format!("no body returned for uid {uid}")))
        })
        .await
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<(), ImapError> {
        self.leave_idle().await?;
        let session = self.session_mut()?;
        op(async {
            let responses: Vec<_> = session
                .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
                .await
                .map_err(imap_error)?
                .collect()
                .await;

            for response in responses {
                response.map_err(imap_error)?;
            }
            Ok(())
        })
        .await
    }

    async fn idle_wait(&mut self, wait: Duration) -> Result<IdleEvent, ImapError> {
        if !self.supports_idle {
            return Err(ImapError::Protocol("server does not support IDLE".to_string()));
        }
        self.ensure_idle().await?;
        let Some(handle) = self.idle.as_mut() else {
            return Err(ImapError::NotConnected);
        };

        let (idle_future, _stop_source) = handle.wait();
        match tokio::time::timeout(wait, idle_future).await {
            Ok(Ok(_)) => {
                self.leave_idle().await?;
                Ok(IdleEvent::NewData)
            }
            Ok(Err(e)) => {
                // Connection state unknown; discard the session
                self.idle = None;
                Err(imap_error(e))
            }
            Err(_) => Ok(IdleEvent::Timeout),
        }
    }

    async fn reset_idle(&mut self) -> Result<(), ImapError> {
        self.leave_idle().await
    }

    async fn close(&mut self) {
        if let Some(handle) = self.idle.take()
            && let Ok(session) = handle.done().await
        {
            self.session = Some(session);
        }
        if let Some(mut session) = self.session.take() {
            let _ = tokio::time::timeout(
                Duration::from_secs(IMAP_OP_TIMEOUT_SECS),
                session.logout(),
            )
            .await;
        }
    }
}
