//! Core engine: daily discovery, per-race jobs and settlement.

pub mod jobs;
pub mod poller;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use jobs::JobBook;
pub use poller::ResultPoller;
pub use retry::Invoker;
pub use runner::{JobOutcome, JobRunner};
pub use scheduler::Scheduler;

use chrono::{DateTime, Utc};

/// Source of "now" for cutoff and scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant (replays and tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
