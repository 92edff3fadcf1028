//! Persistence layer.
//!
//! - `state`: the chase state JSON file (atomic, single writer)
//! - `journal`: SQLite rows for schedules and bets
//! - `audit`: append-only CSV of settled legs

pub mod audit;
pub mod journal;
pub mod state;

pub use audit::AuditLog;
pub use journal::Journal;
pub use state::{StateGuard, StateStore};
