//! Polling dispatcher: selects due accounts and submits bounded work.
//!
//! Runs on an external cadence. Submits independent, short-lived jobs;
//! it never touches mailbox content or cursors.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::constants::{JOB_EXPIRY_SECS, MIN_POLL_INTERVAL_SECS, POLL_JITTER_FRACTION};
use crate::queue::{JobQueue, JobReason, PollJob};
use crate::store::{AccountSyncState, Store};

/// Whether an account should be polled now. The effective interval is
/// floored and jittered ±10% so same-interval accounts spread out
/// instead of stampeding together.
pub fn is_due<R: Rng>(account: &AccountSyncState, now: i64, rng: &mut R) -> bool {
    if !account.inbound_enabled {
        return false;
    }
    if account.in_backoff(now) {
        return false;
    }
    let Some(last_polled_at) = account.last_polled_at else {
        return true;
    };
    let interval = account.poll_interval.max(MIN_POLL_INTERVAL_SECS) as f64;
    let jitter = 1.0 + POLL_JITTER_FRACTION * (rng.r#gen::<f64>() * 2.0 - 1.0);
    now - last_polled_at >= (interval * jitter) as i64
}

pub struct Dispatcher {
    store: Arc<Store>,
    queue: Arc<dyn JobQueue>,
    environment: String,
    max_enqueues: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<dyn JobQueue>,
        environment: String,
        max_enqueues: usize,
    ) -> Self {
        Self {
            store,
            queue,
            environment,
            max_enqueues,
        }
    }

    /// One tick: bounded candidate set (most recently configured
    /// first), filtered to due accounts, shuffled, submitted with a
    /// short expiry. Returns the number of jobs submitted.
    pub async fn run_tick<R: Rng>(&self, rng: &mut R) -> Result<usize> {
        let now = Utc::now().timestamp();
        let candidates = self
            .store
            .poll_candidates(&self.environment, self.max_enqueues)
            .await?;

        let mut due: Vec<AccountSyncState> = candidates
            .into_iter()
            .filter(|account| is_due(account, now, rng))
            .collect();
        due.shuffle(rng);

        let mut submitted = 0;
        for account in &due {
            let job = PollJob::new(&account.account_id, JobReason::Scheduled, now, JOB_EXPIRY_SECS);
            match self.queue.submit(job).await {
                Ok(()) => submitted += 1,
                Err(e) => {
                    // Skipped, not fatal: the next tick self-heals
                    tracing::warn!(
                        account = %account.account_id,
                        "poll job submission failed: {e}"
                    );
                }
            }
        }

        if submitted > 0 {
            tracing::debug!(submitted, due = due.len(), "dispatch tick complete");
        }
        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::Ordering;

    use crate::queue::stubs::RecordingQueue;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn account(id: &str) -> AccountSyncState {
        AccountSyncState::new(id, "production", &format!("{id}@example.com"), "imap.example.com")
    }

    #[test]
    fn never_polled_is_due() {
        assert!(is_due(&account("a"), 10_000, &mut rng()));
    }

    #[test]
    fn disabled_is_never_due() {
        let mut acct = account("a");
        acct.inbound_enabled = false;
        assert!(!is_due(&acct, 10_000, &mut rng()));
    }

    #[test]
    fn backoff_excludes_account() {
        let mut acct = account("a");
        acct.backoff_until = Some(11_000);
        assert!(!is_due(&acct, 10_000, &mut rng()));
        // Window elapsed: due again (never polled)
        assert!(is_due(&acct, 11_000, &mut rng()));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        // interval 100s: due beyond 110s regardless of jitter, never
        // due below 90s
        let mut acct = account("a");
        acct.poll_interval = 100;
        acct.last_polled_at = Some(10_000);

        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(is_due(&acct, 10_000 + 111, &mut rng));
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(!is_due(&acct, 10_000 + 89, &mut rng));
        }
    }

    #[test]
    fn interval_is_floored() {
        // A 5s interval is clamped to the 30s floor
        let mut acct = account("a");
        acct.poll_interval = 5;
        acct.last_polled_at = Some(10_000);
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(!is_due(&acct, 10_000 + 20, &mut rng));
        }
    }

    #[test]
    fn scenario_thirty_second_interval_polled_forty_ago() {
        // 40s since the last poll clears the jittered 30s window
        let mut acct = account("a");
        acct.poll_interval = 30;
        acct.last_polled_at = Some(10_000 - 40);
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            assert!(is_due(&acct, 10_000, &mut rng));
        }
    }

    #[tokio::test]
    async fn tick_submits_due_accounts_with_expiry() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.upsert_account(&account("due-1")).await.unwrap();
        store.upsert_account(&account("due-2")).await.unwrap();
        let mut fresh = account("fresh");
        fresh.last_polled_at = Some(Utc::now().timestamp());
        store.upsert_account(&fresh).await.unwrap();

        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            queue.clone(),
            "production".to_string(),
            100,
        );

        let submitted = dispatcher.run_tick(&mut rng()).await.unwrap();
        assert_eq!(submitted, 2);

        let jobs = queue.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        for job in jobs.iter() {
            assert_eq!(job.reason, JobReason::Scheduled);
            assert_eq!(job.expires_at - job.enqueued_at, JOB_EXPIRY_SECS);
            assert!(job.account_id.starts_with("due-"));
        }
    }

    #[tokio::test]
    async fn tick_respects_candidate_cap() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        for i in 0..10 {
            store.upsert_account(&account(&format!("acct-{i}"))).await.unwrap();
        }

        let queue = Arc::new(RecordingQueue::default());
        let dispatcher =
            Dispatcher::new(Arc::clone(&store), queue.clone(), "production".to_string(), 3);

        let submitted = dispatcher.run_tick(&mut rng()).await.unwrap();
        assert_eq!(submitted, 3);
    }

    #[tokio::test]
    async fn submission_failures_are_skipped_not_fatal() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.upsert_account(&account("a")).await.unwrap();

        let queue = Arc::new(RecordingQueue::default());
        queue.fail.store(true, Ordering::Relaxed);
        let dispatcher =
            Dispatcher::new(Arc::clone(&store), queue.clone(), "production".to_string(), 10);

        let submitted = dispatcher.run_tick(&mut rng()).await.unwrap();
        assert_eq!(submitted, 0);
        assert_eq!(queue.count(), 0);
    }

    #[tokio::test]
    async fn tick_ignores_foreign_environment() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut foreign = account("a");
        foreign.environment = "staging".to_string();
        store.upsert_account(&foreign).await.unwrap();

        let queue = Arc::new(RecordingQueue::default());
        let dispatcher =
            Dispatcher::new(Arc::clone(&store), queue.clone(), "production".to_string(), 10);

        assert_eq!(dispatcher.run_tick(&mut rng()).await.unwrap(), 0);
    }
}
