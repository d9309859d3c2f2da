mod config;
mod constants;
mod error;
mod ingest;
mod lease;
mod mail;
mod queue;
mod store;
mod sync;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::ingest::{BasicMessageParser, EnvCredentialResolver, LogSink, OpenAllowList};
use crate::lease::{LeaseStore, SqliteLeaseStore};
use crate::mail::{ImapConnector, MailboxConnector};
use crate::queue::{JobQueue, MemoryJobQueue, run_queue_worker};
use crate::store::Store;
use crate::sync::{Dispatcher, PollWorker};
use crate::watcher::{WatcherManager, WatcherSettings};

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailsync=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    eprintln!(
        r#"mailsync - multi-tenant IMAP mailbox synchronization daemon

Usage: mailsync [command]

Commands:
    (none)      Run a watcher/worker process (same as 'run')
    run         Run a watcher/worker process until SIGINT
    tick        Run one dispatch tick and execute the due passes
    add-account <id> <address> <imap-host> <credential-env-var>
                Register or update an account in this environment
    help        Show this help message

Configuration file: ~/.config/mailsync/config.toml
"#
    );
}

struct Services {
    store: Arc<Store>,
    lease_store: Arc<dyn LeaseStore>,
    connector: Arc<dyn MailboxConnector>,
    token: String,
}

async fn services(config: &Config) -> Result<Services> {
    let store = Arc::new(Store::open(&config.database_path()?).await?);
    let lease_store: Arc<dyn LeaseStore> = Arc::new(SqliteLeaseStore::new(store.pool().clone()));
    let connector: Arc<dyn MailboxConnector> =
        Arc::new(ImapConnector::new(Arc::new(EnvCredentialResolver)));
    Ok(Services {
        store,
        lease_store,
        connector,
        token: lease::runner_token(),
    })
}

fn poll_worker(services: &Services, config: &Config) -> Arc<PollWorker> {
    Arc::new(PollWorker::new(
        Arc::clone(&services.store),
        Arc::clone(&services.lease_store),
        Arc::clone(&services.connector),
        Arc::new(BasicMessageParser),
        Arc::new(LogSink),
        Arc::new(OpenAllowList),
        config.runner.environment.clone(),
        services.token.clone(),
    ))
}

/// Long-running process: IDLE watcher fleet, queue workers, and
/// self-scheduled dispatcher ticks. Exits cleanly on SIGINT.
async fn run(config: Config) -> Result<()> {
    let services = services(&config).await?;
    let worker = poll_worker(&services, &config);

    let (queue, rx) = MemoryJobQueue::channel();
    let queue: Arc<dyn JobQueue> = Arc::new(queue);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut workers = Vec::new();
    for _ in 0..config.runner.workers.max(1) {
        workers.push(tokio::spawn(run_queue_worker(
            Arc::clone(&rx),
            Arc::clone(&worker),
            shutdown_rx.clone(),
        )));
    }

    let dispatcher = Dispatcher::new(
        Arc::clone(&services.store),
        Arc::clone(&queue),
        config.runner.environment.clone(),
        config.dispatch.max_enqueues_per_run,
    );
    let tick_interval = Duration::from_secs(config.dispatch.tick_interval_secs.max(1));
    let mut dispatch_shutdown = shutdown_rx.clone();
    let dispatch_task = tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut tick = tokio::time::interval(tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = dispatch_shutdown.changed() => {
                    if changed.is_err() || *dispatch_shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = dispatcher.run_tick(&mut rng).await {
                        tracing::warn!("dispatch tick failed: {e:#}");
                    }
                }
            }
        }
    });

    let settings = WatcherSettings {
        environment: config.runner.environment.clone(),
        capacity: config.runner.capacity,
        scan_interval: Duration::from_secs(config.runner.scan_interval_secs.max(1)),
        lease_ttl_secs: config.runner.lease_ttl_secs,
        reissue_interval: Duration::from_secs(config.runner.reissue_interval_secs.max(60)),
        debounce_window_secs: config.runner.debounce_window_secs,
    };
    let mut manager = WatcherManager::new(
        Arc::clone(&services.store),
        Arc::clone(&services.lease_store),
        Arc::clone(&queue),
        Arc::clone(&services.connector),
        settings,
        services.token.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
        }
        shutdown_tx.send(true).ok();
    });

    manager.run(shutdown_rx).await;

    dispatch_task.await.ok();
    for worker_task in workers {
        worker_task.await.ok();
    }
    Ok(())
}

/// One dispatcher tick, executing the resulting passes inline. Meant
/// for external schedulers and manual runs.
async fn tick(config: Config) -> Result<()> {
    let services = services(&config).await?;
    let worker = poll_worker(&services, &config);

    let (queue, mut rx) = MemoryJobQueue::channel();
    let dispatcher = Dispatcher::new(
        Arc::clone(&services.store),
        Arc::new(queue),
        config.runner.environment.clone(),
        config.dispatch.max_enqueues_per_run,
    );

    let mut rng = StdRng::from_entropy();
    let submitted = dispatcher.run_tick(&mut rng).await?;
    tracing::info!(submitted, "dispatch tick submitted jobs");

    rx.close();
    while let Some(job) = rx.recv().await {
        if let Err(e) = worker.poll_account(&job.account_id).await {
            tracing::error!(account = %job.account_id, "poll pass errored: {e:#}");
        }
    }
    Ok(())
}

/// Register or update an account row from the command line.
async fn add_account(config: Config, args: &[String]) -> Result<()> {
    let [account_id, address, imap_host, credential_ref] = args else {
        eprintln!("Usage: mailsync add-account <id> <address> <imap-host> <credential-env-var>");
        std::process::exit(1);
    };

    let mut account = crate::store::AccountSyncState::new(
        account_id,
        &config.runner.environment,
        address,
        imap_host,
    );
    account.credential_ref = credential_ref.clone();
    account.updated_at = chrono::Utc::now().timestamp();

    let store = Store::open(&config.database_path()?).await?;
    store.upsert_account(&account).await?;
    println!(
        "account '{}' registered in environment '{}'",
        account.account_id, account.environment
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    match std::env::args().nth(1).as_deref() {
        None | Some("run") => run(Config::load()?).await,
        Some("tick") => tick(Config::load()?).await,
        Some("add-account") => {
            let args: Vec<String> = std::env::args().skip(2).collect();
            add_account(Config::load()?, &args).await
        }
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("Unknown command: {other}\n");
            print_usage();
            std::process::exit(1);
        }
    }
}
