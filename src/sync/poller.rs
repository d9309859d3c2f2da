//! Per-account incremental synchronization pass.
//!
//! One pass is exclusive (lease), bounded (candidate cap, sequential
//! sub-batches, per-operation timeouts), and resumable: the cursor
//! only ever advances over contiguously handled messages, so a
//! crashed or halted pass is picked up by the next one. Downstream
//! delivery is at-least-once; the sink tolerates redundancy.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::constants::{
    CHUNKED_SEARCH_THRESHOLD, FETCH_BATCH_SIZE, MAX_MESSAGES_PER_ACCOUNT, POLL_LEASE_TTL_SECS,
    SEARCH_CHUNK_SIZE,
};
use crate::error::ImapError;
use crate::ingest::{AllowListChecker, IngestionSink, MessageParser};
use crate::lease::{self, LeaseStore};
use crate::mail::{MailboxConnector, MailboxSession, MailboxStatus, SearchOutcome};
use crate::store::{AccountSyncState, Store, SyncCursor};

/// Result of one `poll_account` invocation.
#[derive(Debug)]
pub enum PassOutcome {
    /// Another process holds the account's poll lease.
    Contended,
    /// Account missing, disabled, or owned by another environment.
    Ineligible,
    /// First contact: baseline cursor recorded, no mail ingested.
    Baseline { cursor: SyncCursor },
    /// Pass completed, possibly with zero candidates.
    Synced(PassStats),
    /// Connection-level failure; backoff recorded on the account.
    Failed { error: String, backoff_until: i64 },
}

#[derive(Debug, Default, Clone)]
pub struct PassStats {
    /// Candidates discovered, after capping.
    pub discovered: usize,
    /// Messages handled: ingested plus skipped.
    pub handled: usize,
    pub ingested: usize,
    /// Handled without ingesting (disallowed sender).
    pub skipped: usize,
    pub cursor: Option<SyncCursor>,
    /// A per-message failure halted the pass early.
    pub halted: bool,
}

/// Internal split between errors that become backoff state and errors
/// that must reach process supervision.
enum PassError {
    Imap(ImapError),
    Store(anyhow::Error),
}

impl From<ImapError> for PassError {
    fn from(e: ImapError) -> Self {
        PassError::Imap(e)
    }
}

impl From<anyhow::Error> for PassError {
    fn from(e: anyhow::Error) -> Self {
        PassError::Store(e)
    }
}

enum Disposition {
    Ingested,
    Skipped,
}

pub struct PollWorker {
    store: Arc<Store>,
    lease: Arc<dyn LeaseStore>,
    connector: Arc<dyn MailboxConnector>,
    parser: Arc<dyn MessageParser>,
    sink: Arc<dyn IngestionSink>,
    allowlist: Arc<dyn AllowListChecker>,
    environment: String,
    token: String,
}

impl PollWorker {
    pub fn new(
        store: Arc<Store>,
        lease: Arc<dyn LeaseStore>,
        connector: Arc<dyn MailboxConnector>,
        parser: Arc<dyn MessageParser>,
        sink: Arc<dyn IngestionSink>,
        allowlist: Arc<dyn AllowListChecker>,
        environment: String,
        token: String,
    ) -> Self {
        Self {
            store,
            lease,
            connector,
            parser,
            sink,
            allowlist,
            environment,
            token,
        }
    }

    /// One exclusive synchronization pass. Safe to invoke redundantly:
    /// a concurrent second invocation loses the lease race and returns
    /// without contacting the mailbox.
    pub async fn poll_account(&self, account_id: &str) -> Result<PassOutcome> {
        let key = lease::poll_key(account_id);
        if !self
            .lease
            .try_acquire(&key, &self.token, POLL_LEASE_TTL_SECS)
            .await?
        {
            // Normal under contention, not an error
            tracing::debug!(account = account_id, "poll lease held elsewhere, skipping");
            return Ok(PassOutcome::Contended);
        }

        let outcome = self.run_pass(account_id).await;

        if let Err(e) = self.lease.release(&key, &self.token).await {
            tracing::warn!(account = account_id, "poll lease release failed: {e}");
        }
        outcome
    }

    async fn run_pass(&self, account_id: &str) -> Result<PassOutcome> {
        let Some(account) = self.store.get_account(account_id).await? else {
            tracing::debug!(account = account_id, "unknown account, skipping");
            return Ok(PassOutcome::Ineligible);
        };
        if !account.inbound_enabled || account.environment != self.environment {
            return Ok(PassOutcome::Ineligible);
        }

        let mut session = match self.connector.open(&account).await {
            Ok(session) => session,
            Err(e) => return self.record_failure(&account, &e).await,
        };

        let result = self.sync_mailbox(&account, session.as_mut()).await;
        session.close().await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(PassError::Imap(e)) => self.record_failure(&account, &e).await,
            Err(PassError::Store(e)) => Err(e),
        }
    }

    async fn record_failure(
        &self,
        account: &AccountSyncState,
        error: &ImapError,
    ) -> Result<PassOutcome> {
        let now = Utc::now().timestamp();
        let backoff_until = self
            .store
            .record_failure(&account.account_id, &error.to_string(), now)
            .await?;
        tracing::warn!(
            account = %account.account_id,
            backoff_until,
            "poll pass failed: {error}"
        );
        Ok(PassOutcome::Failed {
            error: error.to_string(),
            backoff_until,
        })
    }

    async fn sync_mailbox(
        &self,
        account: &AccountSyncState,
        session: &mut dyn MailboxSession,
    ) -> Result<PassOutcome, PassError> {
        let status = session.status();

        let Some(stored) = account.cursor else {
            // First contact: record where the mailbox ends so only
            // mail arriving after onboarding is ever ingested. The
            // pre-existing backlog is deliberately left alone.
            let cursor = SyncCursor::new(status.generation, status.uid_next.saturating_sub(1));
            let now = Utc::now().timestamp();
            self.store
                .commit_pass(&account.account_id, Some(&cursor), now)
                .await?;
            tracing::info!(
                account = %account.account_id,
                %cursor,
                "first contact, baseline cursor recorded"
            );
            return Ok(PassOutcome::Baseline { cursor });
        };

        if stored.generation.is_some_and(|g| g != status.generation) {
            tracing::info!(
                account = %account.account_id,
                stored = ?stored.generation,
                current = status.generation,
                "mailbox generation changed, restarting from origin"
            );
        }
        let start = stored.start_sequence(status.generation);

        let mut candidates = discover(session, start, status).await?;
        if candidates.len() > MAX_MESSAGES_PER_ACCOUNT {
            tracing::debug!(
                account = %account.account_id,
                discovered = candidates.len(),
                cap = MAX_MESSAGES_PER_ACCOUNT,
                "truncating candidate set"
            );
            candidates.truncate(MAX_MESSAGES_PER_ACCOUNT);
        }

        let mut stats = PassStats {
            discovered: candidates.len(),
            ..PassStats::default()
        };
        let mut highest = start;

        // The session carries one command at a time, so batches run
        // strictly sequentially in ascending UID order.
        'batches: for batch in candidates.chunks(FETCH_BATCH_SIZE) {
            for &uid in batch {
                match self.handle_message(account, session, uid).await {
                    Ok(Disposition::Ingested) => {
                        stats.ingested += 1;
                        highest = uid;
                    }
                    Ok(Disposition::Skipped) => {
                        stats.skipped += 1;
                        highest = uid;
                    }
                    Err(e) => {
                        // Halt here: the cursor covers only what came
                        // before, the rest retries next pass
                        tracing::warn!(
                            account = %account.account_id,
                            uid,
                            "message handling failed, halting pass: {e:#}"
                        );
                        stats.halted = true;
                        break 'batches;
                    }
                }
            }
        }

        stats.handled = stats.ingested + stats.skipped;
        let cursor = SyncCursor::new(status.generation, highest);
        let now = Utc::now().timestamp();
        self.store
            .commit_pass(&account.account_id, Some(&cursor), now)
            .await?;
        stats.cursor = Some(cursor);

        if stats.handled > 0 {
            tracing::info!(
                account = %account.account_id,
                ingested = stats.ingested,
                skipped = stats.skipped,
                %cursor,
                "poll pass complete"
            );
        }
        Ok(PassOutcome::Synced(stats))
    }

    async fn handle_message(
        &self,
        account: &AccountSyncState,
        session: &mut dyn MailboxSession,
        uid: u32,
    ) -> Result<Disposition> {
        let header = session
            .fetch_header(uid)
            .await
            .context("header fetch failed")?;

        let allowed = match header.sender.as_deref() {
            Some(sender) => {
                self.allowlist
                    .is_sender_allowed(&account.owner_id, &account.account_id, sender)
                    .await
            }
            // No usable sender address: skip rather than rediscover forever
            None => false,
        };
        if !allowed {
            tracing::debug!(
                account = %account.account_id,
                uid = header.uid,
                sender = header.sender.as_deref().unwrap_or("<none>"),
                "sender not allowed, handled without ingesting"
            );
            return Ok(Disposition::Skipped);
        }

        let raw = session.fetch_raw(uid).await.context("body fetch failed")?;
        let message = self
            .parser
            .parse(&raw, &account.address)
            .await
            .context("parse failed")?;
        self.sink
            .ingest(account, message)
            .await
            .context("ingestion failed")?;

        // Best effort: a redundant fetch next pass beats data loss
        if let Err(e) = session.mark_seen(uid).await {
            tracing::warn!(
                account = %account.account_id,
                uid,
                "failed to mark message seen: {e}"
            );
        }

        Ok(Disposition::Ingested)
    }
}

/// Candidate discovery: ascending unseen UIDs above the cursor.
///
/// Primary strategy is one open-ended range search. Servers that
/// decline it get an unbounded UNSEEN search with client-side
/// filtering, or chunked range searches when the UID span is large.
async fn discover(
    session: &mut dyn MailboxSession,
    start: u32,
    status: MailboxStatus,
) -> Result<Vec<u32>, ImapError> {
    let from = start.saturating_add(1);

    match session.search_unseen_range(from, None).await? {
        // Servers clamp `x:*` to the last message when x is past the
        // end; filtering below the cursor covers that
        SearchOutcome::Uids(uids) => {
            return Ok(uids.into_iter().filter(|&uid| uid > start).collect());
        }
        SearchOutcome::Unsupported => {}
    }

    let span = status.uid_next.saturating_sub(from);
    if span > CHUNKED_SEARCH_THRESHOLD {
        search_chunked(session, from, status.uid_next).await
    } else {
        let uids = session.search_unseen().await?;
        let mut uids: Vec<u32> = uids.into_iter().filter(|&uid| uid > start).collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

/// Bounded range searches from `from` up to the server-reported
/// `uid_next`, unioned and deduplicated. Chunks are inclusive and
/// contiguous so edges neither skip nor repeat a UID.
async fn search_chunked(
    session: &mut dyn MailboxSession,
    from: u32,
    uid_next: u32,
) -> Result<Vec<u32>, ImapError> {
    let mut found = BTreeSet::new();
    let mut lo = from;
    while lo < uid_next {
        let hi = lo.saturating_add(SEARCH_CHUNK_SIZE - 1).min(uid_next - 1);
        match session.search_unseen_range(lo, Some(hi)).await? {
            SearchOutcome::Uids(uids) => {
                found.extend(uids.into_iter().filter(|&uid| uid >= lo && uid <= hi));
            }
            SearchOutcome::Unsupported => {
                return Err(ImapError::Protocol(
                    "server rejected chunked UID search".to_string(),
                ));
            }
        }
        if hi == u32::MAX {
            break;
        }
        lo = hi + 1;
    }
    Ok(found.into_iter().collect())
}
