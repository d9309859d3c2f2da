//! Error taxonomy for the sync core.
//!
//! IMAP and network failures are classified at the pass/watcher
//! boundary and translated into backoff state there; they never reach
//! the dispatcher or the reconciliation loop.

use thiserror::Error;

/// IMAP- and network-level failures.
#[derive(Debug, Error)]
pub enum ImapError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("folder '{0}' not selectable")]
    FolderNotFound(String),

    #[error("not connected")]
    NotConnected,
}

/// Raised by the external message parser.
#[derive(Debug, Error)]
#[error("unparseable message: {0}")]
pub struct ParseError(pub String);

/// Raised by the external ingestion sink.
#[derive(Debug, Error)]
#[error("ingestion failed: {0}")]
pub struct IngestError(pub String);
