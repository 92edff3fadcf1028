//! Exchange integrations.
//!
//! Defines the `RacingExchange` trait the engine talks to and provides
//! the Betfair implementation.

pub mod betfair;

use anyhow::Result;
use async_trait::async_trait;
use chrono_tz::Tz;

use crate::types::{Favourite, MarketStatus, RaceEvent, WagerReceipt, WagerRequest};

/// Abstraction over a horse-racing betting exchange.
///
/// `Err` is a transient failure the caller may retry; `Ok(None)` from
/// `resolve_favourite` means the market has no priced runner.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RacingExchange: Send + Sync {
    /// Remaining WIN races from now until local midnight in `tz`,
    /// ordered by start time.
    async fn list_todays_events(&self, tz: Tz) -> Result<Vec<RaceEvent>>;

    /// Runner with the shortest best back price.
    async fn resolve_favourite(&self, event: &RaceEvent) -> Result<Option<Favourite>>;

    /// Place a back bet at the requested price.
    async fn place_wager(&self, request: &WagerRequest) -> Result<WagerReceipt>;

    /// Current market state and, once closed, the winner.
    async fn poll_status(&self, event: &RaceEvent) -> Result<MarketStatus>;
}
