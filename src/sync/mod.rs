//! Due-account scheduling and the per-account poll pass.

pub mod dispatcher;
pub mod poller;

pub use dispatcher::{Dispatcher, is_due};
pub use poller::{PassOutcome, PassStats, PollWorker};
