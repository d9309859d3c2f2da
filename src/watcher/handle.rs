//! Per-account IDLE watcher task.
//!
//! State machine: STARTING (lease race) -> WATCHING (bounded IDLE
//! waits, lease heartbeat, subscription cycling) -> RECONNECTING or
//! STOPPING -> STOPPED. One task per watched account; at most one
//! process fleet-wide watches an account, arbitrated by the watch
//! lease.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{
    IDLE_WAIT_SECS, JOB_EXPIRY_SECS, WATCH_BACKOFF_BASE_SECS, WATCH_BACKOFF_CAP_SECS,
};
use crate::lease::{self, LeaseStore};
use crate::mail::{IdleEvent, MailboxConnector, MailboxSession};
use crate::queue::{JobQueue, JobReason, PollJob};
use crate::store::AccountSyncState;

/// Why a watcher task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// Another process holds the account's watch lease.
    LeaseHeld,
    /// Lease ownership was lost mid-watch.
    LeaseLost,
    /// Server does not advertise IDLE; polling covers this account.
    IdleUnsupported,
    /// Stop signal honored.
    Stopped,
}

/// In-process control handle for one watcher task.
pub struct WatcherHandle {
    pub account_id: String,
    /// Display address, for operator-facing logs.
    pub address: String,
    /// Connection-parameter signature captured at start; a mismatch on
    /// reconcile forces a restart.
    pub signature: String,
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<WatchExit>,
}

impl WatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop without waiting for it. Non-blocking; a
    /// full buffer means a stop is already pending.
    pub fn signal_stop(&self) {
        self.stop_tx.try_send(()).ok();
    }

    /// Collect the exit of an already-finished task.
    pub async fn join(self) -> Option<WatchExit> {
        self.task.await.ok()
    }

    /// Wait for the task, bounded; a task that does not exit in time
    /// is aborted. Pair with [`WatcherHandle::signal_stop`].
    pub async fn join_timeout(mut self, wait: Duration) -> Option<WatchExit> {
        match tokio::time::timeout(wait, &mut self.task).await {
            Ok(result) => result.ok(),
            Err(_) => {
                self.task.abort();
                None
            }
        }
    }

    /// Signal stop and wait, bounded.
    pub async fn stop(self, wait: Duration) -> Option<WatchExit> {
        self.signal_stop();
        self.join_timeout(wait).await
    }
}

/// Everything one watcher task needs, captured at spawn time.
pub(crate) struct WatcherContext {
    pub account: AccountSyncState,
    pub lease: Arc<dyn LeaseStore>,
    pub queue: Arc<dyn JobQueue>,
    pub connector: Arc<dyn MailboxConnector>,
    /// This process's identity; doubles as the lease token.
    pub token: String,
    pub lease_ttl_secs: i64,
    pub reissue_interval: Duration,
    pub debounce_ttl_secs: i64,
}

pub(crate) fn spawn_watcher(ctx: WatcherContext) -> WatcherHandle {
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let account_id = ctx.account.account_id.clone();
    let address = ctx.account.address.clone();
    let signature = ctx.account.connection_signature();
    tracing::debug!(account = %account_id, address = %address, "starting watcher");
    let task = tokio::spawn(watch_account(ctx, stop_rx));
    WatcherHandle {
        account_id,
        address,
        signature,
        stop_tx,
        task,
    }
}

/// Sleep that aborts early on stop. Returns false when stopped.
async fn sleep_or_stop(stop_rx: &mut mpsc::Receiver<()>, wait: Duration) -> bool {
    tokio::select! {
        _ = stop_rx.recv() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

enum SessionEnd {
    Stopped,
    LeaseLost,
    ConnectionError,
}

pub(crate) async fn watch_account(
    ctx: WatcherContext,
    mut stop_rx: mpsc::Receiver<()>,
) -> WatchExit {
    let account_id = ctx.account.account_id.clone();
    let key = lease::watch_key(&account_id);
    let mut backoff = WATCH_BACKOFF_BASE_SECS;

    loop {
        // STARTING: race other processes for this account
        match ctx.lease.try_acquire(&key, &ctx.token, ctx.lease_ttl_secs).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(account = %account_id, "watch lease held elsewhere");
                return WatchExit::LeaseHeld;
            }
            Err(e) => {
                tracing::warn!(account = %account_id, "watch lease acquisition failed: {e}");
                return WatchExit::LeaseHeld;
            }
        }

        let mut session = match ctx.connector.open(&ctx.account).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(account = %account_id, "watcher connect failed: {e}");
                // RECONNECTING: free the lease so another process may
                // take over while this one backs off
                ctx.lease.release(&key, &ctx.token).await.ok();
                if !sleep_or_stop(&mut stop_rx, Duration::from_secs(backoff)).await {
                    return WatchExit::Stopped;
                }
                backoff = (backoff * 2).min(WATCH_BACKOFF_CAP_SECS);
                continue;
            }
        };

        if !session.supports_idle() {
            tracing::info!(
                account = %account_id,
                "server lacks IDLE capability, falling back to polling"
            );
            session.close().await;
            ctx.lease.release(&key, &ctx.token).await.ok();
            return WatchExit::IdleUnsupported;
        }

        backoff = WATCH_BACKOFF_BASE_SECS;
        tracing::debug!(account = %account_id, "watching");

        match watch_session(&ctx, &key, session.as_mut(), &mut stop_rx).await {
            SessionEnd::Stopped => {
                session.close().await;
                ctx.lease.release(&key, &ctx.token).await.ok();
                return WatchExit::Stopped;
            }
            SessionEnd::LeaseLost => {
                // Another process owns the account now; exit without
                // issuing further mailbox commands
                return WatchExit::LeaseLost;
            }
            SessionEnd::ConnectionError => {
                session.close().await;
                ctx.lease.release(&key, &ctx.token).await.ok();
                if !sleep_or_stop(&mut stop_rx, Duration::from_secs(backoff)).await {
                    return WatchExit::Stopped;
                }
                backoff = (backoff * 2).min(WATCH_BACKOFF_CAP_SECS);
            }
        }
    }
}

/// WATCHING: bounded IDLE waits with lease heartbeat and periodic
/// subscription re-issue.
async fn watch_session(
    ctx: &WatcherContext,
    key: &str,
    session: &mut dyn MailboxSession,
    stop_rx: &mut mpsc::Receiver<()>,
) -> SessionEnd {
    let account_id = &ctx.account.account_id;
    let renew_every = Duration::from_secs((ctx.lease_ttl_secs / 3).max(1) as u64);
    let mut last_renew = Instant::now();
    let mut last_reissue = Instant::now();

    loop {
        // Verify ownership before every server command; losing the
        // lease must stop this watcher within one iteration
        match ctx.lease.is_held_by(key, &ctx.token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(account = %account_id, "watch lease lost, stopping");
                return SessionEnd::LeaseLost;
            }
            Err(e) => {
                tracing::warn!(account = %account_id, "lease probe failed: {e}");
                return SessionEnd::LeaseLost;
            }
        }

        if last_renew.elapsed() >= renew_every {
            match ctx.lease.renew(key, &ctx.token, ctx.lease_ttl_secs).await {
                Ok(true) => last_renew = Instant::now(),
                Ok(false) => {
                    tracing::info!(account = %account_id, "watch lease expired under us");
                    return SessionEnd::LeaseLost;
                }
                Err(e) => {
                    tracing::warn!(account = %account_id, "lease renew failed: {e}");
                    return SessionEnd::LeaseLost;
                }
            }
        }

        // Cycle the subscription before the server times it out
        if last_reissue.elapsed() >= ctx.reissue_interval {
            if let Err(e) = session.reset_idle().await {
                tracing::warn!(account = %account_id, "IDLE re-issue failed: {e}");
                return SessionEnd::ConnectionError;
            }
            last_reissue = Instant::now();
        }

        tokio::select! {
            biased;
            _ = stop_rx.recv() => return SessionEnd::Stopped,
            event = session.idle_wait(Duration::from_secs(IDLE_WAIT_SECS)) => match event {
                Ok(IdleEvent::NewData) => trigger_poll(ctx).await,
                Ok(IdleEvent::Timeout) => {}
                Err(e) => {
                    tracing::warn!(account = %account_id, "watch connection error: {e}");
                    return SessionEnd::ConnectionError;
                }
            },
        }
    }
}

/// Collapse a burst of notifications into one poll trigger. Best
/// effort: a lost marker only costs an extra poll, and the dispatcher
/// remains the safety net for missed ones.
async fn trigger_poll(ctx: &WatcherContext) {
    let account_id = &ctx.account.account_id;
    let dkey = lease::debounce_key(account_id);
    match ctx
        .lease
        .try_acquire(&dkey, &ctx.token, ctx.debounce_ttl_secs)
        .await
    {
        Ok(true) => {
            let now = Utc::now().timestamp();
            let job = PollJob::new(account_id, JobReason::PushEvent, now, JOB_EXPIRY_SECS);
            if let Err(e) = ctx.queue.submit(job).await {
                tracing::warn!(account = %account_id, "push-triggered submission failed: {e}");
            } else {
                tracing::debug!(account = %account_id, "push notification, poll enqueued");
            }
        }
        Ok(false) => {
            tracing::debug!(account = %account_id, "notification debounced");
        }
        Err(e) => {
            tracing::warn!(account = %account_id, "debounce probe failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::error::ImapError;
    use crate::lease::MemoryLeaseStore;
    use crate::mail::fake::{FakeConnector, FakeState};
    use crate::queue::stubs::RecordingQueue;

    struct Fixture {
        lease: Arc<MemoryLeaseStore>,
        queue: Arc<RecordingQueue>,
        state: Arc<Mutex<FakeState>>,
    }

    fn account() -> AccountSyncState {
        AccountSyncState::new("acct", "production", "agent@example.com", "imap.example.com")
    }

    fn fixture(state: Arc<Mutex<FakeState>>) -> (Fixture, WatcherContext) {
        let lease = Arc::new(MemoryLeaseStore::new());
        let queue = Arc::new(RecordingQueue::default());
        let ctx = WatcherContext {
            account: account(),
            lease: Arc::clone(&lease) as Arc<dyn LeaseStore>,
            queue: Arc::clone(&queue) as Arc<dyn JobQueue>,
            connector: Arc::new(FakeConnector::new(Arc::clone(&state))),
            token: "runner-a".to_string(),
            lease_ttl_secs: 120,
            reissue_interval: Duration::from_secs(25 * 60),
            debounce_ttl_secs: 300,
        };
        (
            Fixture {
                lease,
                queue,
                state,
            },
            ctx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_lease_prevents_start() {
        let state = FakeState::with_messages(1, &[]);
        let (fx, ctx) = fixture(state);
        fx.lease
            .try_acquire(&lease::watch_key("acct"), "runner-b", 600)
            .await
            .unwrap();

        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let exit = watch_account(ctx, stop_rx).await;

        assert_eq!(exit, WatchExit::LeaseHeld);
        assert_eq!(fx.state.lock().unwrap().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_idle_capability_stops_without_retry() {
        let state = FakeState::with_messages(1, &[]);
        state.lock().unwrap().supports_idle = false;
        let (fx, ctx) = fixture(state);

        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let exit = watch_account(ctx, stop_rx).await;

        assert_eq!(exit, WatchExit::IdleUnsupported);
        assert_eq!(fx.state.lock().unwrap().opens, 1);
        // Lease released: any process can take the account
        assert!(fx
            .lease
            .try_acquire(&lease::watch_key("acct"), "runner-b", 60)
            .await
            .unwrap());
        // Session was shut down cleanly
        let commands = fx.state.lock().unwrap().commands.clone();
        assert_eq!(commands.last().map(String::as_str), Some("logout"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_notifications_enqueues_one_poll() {
        let state = FakeState::with_messages(1, &[]);
        for _ in 0..3 {
            state
                .lock()
                .unwrap()
                .idle_events
                .push_back(Ok(IdleEvent::NewData));
        }
        let (fx, ctx) = fixture(state);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_account(ctx, stop_rx));

        // Let the watcher drain the scripted burst
        tokio::time::sleep(Duration::from_secs(30)).await;
        stop_tx.send(()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, WatchExit::Stopped);
        let jobs = fx.queue.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].account_id, "acct");
        assert_eq!(jobs[0].reason, JobReason::PushEvent);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_stops_within_one_iteration() {
        let state = FakeState::with_messages(1, &[]);
        let (fx, ctx) = fixture(state);

        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_account(ctx, stop_rx));

        // Let it reach the watch loop, then force the lease away
        tokio::time::sleep(Duration::from_secs(12)).await;
        fx.lease
            .release(&lease::watch_key("acct"), "runner-a")
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WatchExit::LeaseLost);

        // No teardown commands were sent after the loss
        let commands = fx.state.lock().unwrap().commands.clone();
        assert!(!commands.contains(&"logout".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_releases_lease_and_logs_out() {
        let state = FakeState::with_messages(1, &[]);
        let (fx, ctx) = fixture(state);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_account(ctx, stop_rx));

        tokio::time::sleep(Duration::from_secs(12)).await;
        stop_tx.send(()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, WatchExit::Stopped);
        assert!(fx
            .lease
            .try_acquire(&lease::watch_key("acct"), "runner-b", 60)
            .await
            .unwrap());
        let commands = fx.state.lock().unwrap().commands.clone();
        assert_eq!(commands.last().map(String::as_str), Some("logout"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_backs_off_then_recovers() {
        let state = FakeState::with_messages(1, &[]);
        state
            .lock()
            .unwrap()
            .connect_failures
            .push_back(ImapError::Connect("refused".to_string()));
        let (fx, ctx) = fixture(state);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_account(ctx, stop_rx));

        // First attempt fails, backoff elapses, second connects
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.state.lock().unwrap().opens, 2);

        stop_tx.send(()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WatchExit::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_error_releases_lease_for_takeover() {
        let state = FakeState::with_messages(1, &[]);
        state
            .lock()
            .unwrap()
            .idle_events
            .push_back(Err(ImapError::Connect("reset".to_string())));
        let (fx, ctx) = fixture(state);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(watch_account(ctx, stop_rx));

        // The connection error releases the lease during backoff;
        // another process can take the account over meanwhile
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fx
            .lease
            .try_acquire(&lease::watch_key("acct"), "runner-b", 60)
            .await
            .unwrap());
        fx.lease
            .release(&lease::watch_key("acct"), "runner-b")
            .await
            .unwrap();

        // With the key free again, this watcher reconnects after its
        // backoff window
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(fx.state.lock().unwrap().opens >= 2);

        stop_tx.send(()).await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(120), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WatchExit::Stopped);
    }
}
