//! Service-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Floor for per-account poll intervals in seconds.
/// Protects misconfigured accounts from hammering their server.
pub const MIN_POLL_INTERVAL_SECS: i64 = 30;

/// Fraction of the effective poll interval applied as ± jitter.
/// Spreads accounts with identical intervals across the tick cycle.
pub const POLL_JITTER_FRACTION: f64 = 0.1;

/// Upper bound on poll jobs submitted per dispatcher tick.
pub const MAX_ENQUEUES_PER_RUN: usize = 200;

/// Poll jobs not picked up within this window are dropped.
/// A backlogged queue must not pile up stale work.
pub const JOB_EXPIRY_SECS: i64 = 120;

/// Lease duration for one poll pass in seconds.
/// Comfortably exceeds the worst-case pass duration.
pub const POLL_LEASE_TTL_SECS: i64 = 600;

/// Hard cap on messages handled in a single pass.
pub const MAX_MESSAGES_PER_ACCOUNT: usize = 500;

/// Messages are processed sequentially in sub-batches of this size.
pub const FETCH_BATCH_SIZE: usize = 100;

/// Chunk width for the chunked UID SEARCH fallback.
pub const SEARCH_CHUNK_SIZE: u32 = 1000;

/// UID span (uid_next - cursor) above which the chunked fallback is
/// preferred over an unbounded UNSEEN search.
pub const CHUNKED_SEARCH_THRESHOLD: u32 = 10_000;

/// Base connection-failure backoff window in seconds.
pub const BACKOFF_BASE_SECS: i64 = 120;

/// Cap on the connection-failure backoff window in seconds.
pub const BACKOFF_CAP_SECS: i64 = 3600;

/// Per-operation network timeout for IMAP commands in seconds.
pub const IMAP_OP_TIMEOUT_SECS: u64 = 60;

/// Bound on a single IDLE wait slice in seconds.
/// Keeps stop signals and lease heartbeats prompt.
pub const IDLE_WAIT_SECS: u64 = 5;

/// Initial watcher reconnect backoff in seconds.
pub const WATCH_BACKOFF_BASE_SECS: u64 = 5;

/// Cap on the watcher reconnect backoff in seconds.
pub const WATCH_BACKOFF_CAP_SECS: u64 = 300;

/// Cooldown before re-attempting a watcher against a server that does
/// not advertise IDLE.
pub const IDLE_RETRY_COOLDOWN_SECS: i64 = 3600;

/// Bounded wait for watcher tasks to exit on shutdown.
pub const SHUTDOWN_JOIN_TIMEOUT_SECS: u64 = 10;
