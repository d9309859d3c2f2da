//! Poll-job submission and execution.
//!
//! Both the dispatcher and the watcher fleet submit [`PollJob`]s; the
//! jobs execute on queue workers, one pass at a time per worker. Jobs
//! carry an expiry so a backlogged queue sheds stale work instead of
//! piling it up.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use crate::sync::PollWorker;

/// Why a poll job was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobReason {
    /// Regular dispatcher cadence.
    Scheduled,
    /// IDLE watcher observed server activity.
    PushEvent,
}

/// One request to run a poll pass for an account.
#[derive(Debug, Clone)]
pub struct PollJob {
    pub account_id: String,
    pub reason: JobReason,
    pub enqueued_at: i64,
    pub expires_at: i64,
}

impl PollJob {
    pub fn new(account_id: &str, reason: JobReason, now: i64, expires_in_secs: i64) -> Self {
        Self {
            account_id: account_id.to_string(),
            reason,
            enqueued_at: now,
            expires_at: now + expires_in_secs,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn submit(&self, job: PollJob) -> Result<()>;
}

/// In-process queue feeding this process's workers.
pub struct MemoryJobQueue {
    tx: mpsc::UnboundedSender<PollJob>,
}

impl MemoryJobQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PollJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, job: PollJob) -> Result<()> {
        self.tx
            .send(job)
            .map_err(|_| anyhow::anyhow!("job queue closed"))
    }
}

/// Worker loop: drain jobs until shutdown, dropping expired ones and
/// running one poll pass per live job. Pass outcomes are logged here;
/// failures never escape to the loop.
pub async fn run_queue_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PollJob>>>,
    worker: Arc<PollWorker>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => return,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => return,
            },
        };

        let now = Utc::now().timestamp();
        if job.is_expired(now) {
            tracing::debug!(
                account = %job.account_id,
                reason = ?job.reason,
                "dropping expired poll job"
            );
            continue;
        }

        match worker.poll_account(&job.account_id).await {
            Ok(outcome) => {
                tracing::debug!(
                    account = %job.account_id,
                    reason = ?job.reason,
                    outcome = ?outcome,
                    "poll job finished"
                );
            }
            Err(e) => {
                tracing::error!(account = %job.account_id, "poll job errored: {e:#}");
            }
        }
    }
}

#[cfg(test)]
pub mod stubs {
    //! Recording queue for tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Default)]
    pub struct RecordingQueue {
        pub jobs: Mutex<Vec<PollJob>>,
        pub fail: AtomicBool,
    }

    impl RecordingQueue {
        pub fn count(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn submit(&self, job: PollJob) -> Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("queue rejected submission");
            }
            self.jobs.lock().unwrap().push(job);
            Ok(())
        }
    }
}
