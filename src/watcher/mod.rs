//! IDLE watcher fleet manager.
//!
//! One manager per process. It owns the registry of active watcher
//! handles and reconciles it against the eligible account set on a
//! scan interval. Dependencies (store, lease store, job queue,
//! connector) are injected, so several managers can coexist in one
//! test process.

pub mod handle;

pub use handle::{WatchExit, WatcherHandle};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Notify, watch};

use crate::constants::{IDLE_RETRY_COOLDOWN_SECS, SHUTDOWN_JOIN_TIMEOUT_SECS};
use crate::lease::{self, LeaseStore};
use crate::mail::MailboxConnector;
use crate::queue::JobQueue;
use crate::store::Store;
use handle::WatcherContext;

/// Tuning for one watcher process.
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub environment: String,
    /// Bound on concurrently watched accounts in this process.
    pub capacity: usize,
    pub scan_interval: Duration,
    pub lease_ttl_secs: i64,
    pub reissue_interval: Duration,
    pub debounce_window_secs: i64,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            capacity: 50,
            scan_interval: Duration::from_secs(60),
            lease_ttl_secs: 120,
            reissue_interval: Duration::from_secs(25 * 60),
            debounce_window_secs: 10,
        }
    }
}

pub struct WatcherManager {
    store: Arc<Store>,
    lease: Arc<dyn LeaseStore>,
    queue: Arc<dyn JobQueue>,
    connector: Arc<dyn MailboxConnector>,
    settings: WatcherSettings,
    /// This process's identity; the token behind every lease it takes.
    token: String,
    handles: HashMap<String, WatcherHandle>,
    /// Accounts not to retry before the stored time (IDLE-less
    /// servers). Keyed to the connection signature that failed, so a
    /// configuration change clears the cooldown.
    retry_after: HashMap<String, (i64, String)>,
    /// Last logged active set, to log only on change.
    last_logged: Vec<String>,
    wake: Arc<Notify>,
}

impl WatcherManager {
    pub fn new(
        store: Arc<Store>,
        lease: Arc<dyn LeaseStore>,
        queue: Arc<dyn JobQueue>,
        connector: Arc<dyn MailboxConnector>,
        settings: WatcherSettings,
        token: String,
    ) -> Self {
        Self {
            store,
            lease,
            queue,
            connector,
            settings,
            token,
            handles: HashMap::new(),
            retry_after: HashMap::new(),
            last_logged: Vec::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Notifier that wakes the reconciliation loop early, e.g. after a
    /// configuration change.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Number of accounts currently watched by this process.
    pub fn watched(&self) -> usize {
        self.handles.len()
    }

    /// Reconcile on the scan interval (or early wake) until shutdown,
    /// then stop every watcher with a bounded join.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            environment = %self.settings.environment,
            capacity = self.settings.capacity,
            "watcher manager started"
        );
        let mut tick = tokio::time::interval(self.settings.scan_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.reconcile().await {
                // One bad scan must not stop the fleet
                tracing::warn!("watcher reconcile failed: {e:#}");
            }
        }

        self.shutdown_all().await;
        tracing::info!("watcher manager stopped");
    }

    /// One reconciliation pass: reap exited watchers, drop ineligible
    /// or drifted ones, then fill remaining capacity. Every start is
    /// an independent lease race other processes may win.
    pub async fn reconcile(&mut self) -> Result<()> {
        let now = Utc::now().timestamp();
        self.reap(now).await;

        let eligible = self.store.idle_eligible(&self.settings.environment).await?;
        let eligible_ids: HashSet<&str> =
            eligible.iter().map(|a| a.account_id.as_str()).collect();

        let stale: Vec<String> = self
            .handles
            .keys()
            .filter(|id| !eligible_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for account_id in stale {
            self.stop_handle(&account_id, "no longer eligible").await;
        }

        // Configuration drift forces a reconnect with fresh parameters
        for account in &eligible {
            let drifted = self
                .handles
                .get(&account.account_id)
                .is_some_and(|handle| handle.signature != account.connection_signature());
            if drifted {
                self.stop_handle(&account.account_id, "configuration changed")
                    .await;
                self.retry_after.remove(&account.account_id);
            }
        }

        for account in &eligible {
            if self.handles.len() >= self.settings.capacity {
                break;
            }
            if self.handles.contains_key(&account.account_id) {
                continue;
            }
            let cooled_down = self
                .retry_after
                .get(&account.account_id)
                .is_some_and(|(after, signature)| {
                    *after > now && *signature == account.connection_signature()
                });
            if cooled_down {
                continue;
            }

            let ctx = WatcherContext {
                account: account.clone(),
                lease: Arc::clone(&self.lease),
                queue: Arc::clone(&self.queue),
                connector: Arc::clone(&self.connector),
                token: self.token.clone(),
                lease_ttl_secs: self.settings.lease_ttl_secs,
                reissue_interval: self.settings.reissue_interval,
                debounce_ttl_secs: self.settings.debounce_window_secs,
            };
            self.handles
                .insert(account.account_id.clone(), handle::spawn_watcher(ctx));
        }

        self.log_active_set();
        Ok(())
    }

    async fn reap(&mut self, now: i64) {
        let finished: Vec<String> = self
            .handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for account_id in finished {
            let Some(handle) = self.handles.remove(&account_id) else {
                continue;
            };
            let signature = handle.signature.clone();
            let exit = handle.join().await;
            tracing::debug!(account = %account_id, ?exit, "watcher exited");

            if exit == Some(WatchExit::IdleUnsupported) {
                self.retry_after
                    .insert(account_id.clone(), (now + IDLE_RETRY_COOLDOWN_SECS, signature));
            }

            // The task releases its lease on the way out; cover panics
            self.release_if_ours(&account_id).await;
        }
    }

    async fn stop_handle(&mut self, account_id: &str, reason: &str) {
        if let Some(handle) = self.handles.remove(account_id) {
            tracing::info!(account = account_id, reason, "stopping watcher");
            handle
                .stop(Duration::from_secs(SHUTDOWN_JOIN_TIMEOUT_SECS))
                .await;
            self.release_if_ours(account_id).await;
        }
    }

    async fn release_if_ours(&self, account_id: &str) {
        let key = lease::watch_key(account_id);
        if let Ok(true) = self.lease.is_held_by(&key, &self.token).await {
            self.lease.release(&key, &self.token).await.ok();
        }
    }

    fn log_active_set(&mut self) {
        let mut active: Vec<String> = self.handles.keys().cloned().collect();
        active.sort();
        if active != self.last_logged {
            tracing::info!(count = active.len(), watchers = ?active, "active watcher set changed");
            self.last_logged = active;
        }
    }

    async fn shutdown_all(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        tracing::info!(count = self.watched(), "stopping all watchers");

        let handles: Vec<WatcherHandle> =
            self.handles.drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.signal_stop();
        }

        let mut account_ids = Vec::with_capacity(handles.len());
        for handle in handles {
            account_ids.push(handle.account_id.clone());
            handle
                .join_timeout(Duration::from_secs(SHUTDOWN_JOIN_TIMEOUT_SECS))
                .await;
        }
        for account_id in account_ids {
            self.release_if_ours(&account_id).await;
        }
        self.log_active_set();
    }
}
