//! Shared types for the CHASE engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that platform, strategy,
//! storage and engine modules can depend on them without circular
//! references.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Convert an exchange-supplied float into a `Decimal`.
///
/// Betfair reports prices and sizes as JSON floats; everything past the
/// platform boundary is `Decimal`.
pub fn d(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Round a monetary amount half-up to whole pennies.
pub fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

// ---------------------------------------------------------------------------
// Race events
// ---------------------------------------------------------------------------

/// A single race (one WIN market on the exchange).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceEvent {
    /// Exchange market id, e.g. "1.228374651".
    pub id: String,
    /// Market name, e.g. "2m4f Hcap Chs".
    pub name: String,
    /// Venue / meeting name, e.g. "Ascot".
    pub track: String,
    pub start_time: DateTime<Utc>,
}

impl fmt::Display for RaceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.start_time.format("%H:%M"),
            self.track,
            self.name
        )
    }
}

/// A runner in a race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub id: u64,
    pub name: String,
}

/// The favourite of a race and the best back price currently on offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favourite {
    pub selection: Selection,
    /// Decimal odds.
    pub odds: Decimal,
}

// ---------------------------------------------------------------------------
// Market status and settlement
// ---------------------------------------------------------------------------

/// Lifecycle state of an exchange market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketState {
    Inactive,
    Open,
    Suspended,
    Closed,
    Unknown,
}

impl MarketState {
    /// Parse the exchange's status string.
    pub fn from_exchange(status: &str) -> Self {
        match status {
            "INACTIVE" => MarketState::Inactive,
            "OPEN" => MarketState::Open,
            "SUSPENDED" => MarketState::Suspended,
            "CLOSED" => MarketState::Closed,
            _ => MarketState::Unknown,
        }
    }
}

impl fmt::Display for MarketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketState::Inactive => write!(f, "INACTIVE"),
            MarketState::Open => write!(f, "OPEN"),
            MarketState::Suspended => write!(f, "SUSPENDED"),
            MarketState::Closed => write!(f, "CLOSED"),
            MarketState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One observation of a market's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketStatus {
    pub state: MarketState,
    /// Selection id of the settled winner, once the market is closed.
    pub winner: Option<u64>,
}

impl MarketStatus {
    pub fn open() -> Self {
        Self { state: MarketState::Open, winner: None }
    }

    pub fn closed(winner: Option<u64>) -> Self {
        Self { state: MarketState::Closed, winner }
    }
}

/// Final outcome of a wager as observed by the result poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Won,
    Lost,
    /// The configured maximum wait elapsed before the market closed.
    Unknown,
}

impl fmt::Display for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settlement::Won => write!(f, "WON"),
            Settlement::Lost => write!(f, "LOST"),
            Settlement::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wagers
// ---------------------------------------------------------------------------

/// Everything the exchange needs to place a back bet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WagerRequest {
    pub event: RaceEvent,
    pub selection: Selection,
    pub stake: Decimal,
    pub odds: Decimal,
    /// Client reference used by the exchange to de-duplicate retried orders.
    pub customer_ref: String,
}

/// Confirmation of a placed wager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WagerReceipt {
    pub bet_id: String,
    pub market_id: String,
    pub selection_id: u64,
    pub stake: Decimal,
    pub odds: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl fmt::Display for WagerReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bet {} on {}/{}: £{:.2} @ {}",
            self.bet_id, self.market_id, self.selection_id, self.stake, self.odds
        )
    }
}

impl WagerReceipt {
    /// Create a dry-run receipt (no real execution).
    pub fn dry_run(request: &WagerRequest) -> Self {
        Self {
            bet_id: format!("dry-run-{}", uuid::Uuid::new_v4()),
            market_id: request.event.id.clone(),
            selection_id: request.selection.id,
            stake: request.stake,
            odds: request.odds,
            placed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chase state
// ---------------------------------------------------------------------------

/// Current schema version of the persisted chase state.
pub const STATE_VERSION: u32 = 1;

fn state_version_default() -> u32 {
    STATE_VERSION
}

/// Persistent chase state, one per bankroll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaseState {
    #[serde(default = "state_version_default")]
    pub version: u32,
    pub balance: Decimal,
    pub leg: u32,
    pub accumulated_losses: Decimal,
    pub prev_stake: Option<Decimal>,
    pub chase_active: bool,
    pub is_running_race: bool,
    /// Local date of the last daily reset.
    #[serde(default)]
    pub reset_on: Option<NaiveDate>,
}

impl fmt::Display for ChaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "leg={} | balance=£{:.2} | losses=£{:.2} | prev_stake={} | chase={} | running={}",
            self.leg,
            self.balance,
            self.accumulated_losses,
            self.prev_stake
                .map(|s| format!("£{s:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            self.chase_active,
            self.is_running_race,
        )
    }
}

impl ChaseState {
    /// A fresh leg-1 state holding the given bankroll.
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            version: STATE_VERSION,
            balance: money(initial_balance),
            leg: 1,
            accumulated_losses: Decimal::ZERO,
            prev_stake: None,
            chase_active: false,
            is_running_race: false,
            reset_on: None,
        }
    }

    /// Apply a settled leg: update chase progress and bankroll.
    ///
    /// Returns the realised profit (negative on a loss). The running-race
    /// flag is cleared in the same step.
    pub fn apply_settlement(&mut self, stake: Decimal, odds: Decimal, won: bool) -> Decimal {
        let profit = Self::leg_profit(stake, odds, won);

        if won {
            self.accumulated_losses = Decimal::ZERO;
            self.prev_stake = None;
            self.chase_active = false;
            self.leg = 1;
        } else {
            self.accumulated_losses = money(self.accumulated_losses + stake);
            self.prev_stake = Some(stake);
            self.chase_active = true;
            self.leg += 1;
        }

        self.balance = money(self.balance + profit);
        self.is_running_race = false;
        profit
    }

    /// Profit of a settled back bet: `(odds - 1) * stake` on a win, `-stake` on a loss.
    pub fn leg_profit(stake: Decimal, odds: Decimal, won: bool) -> Decimal {
        if won {
            money((odds - Decimal::ONE) * stake)
        } else {
            -stake
        }
    }

    /// Normalise monetary fields to pennies after deserialisation.
    pub fn normalise(&mut self) {
        self.balance = money(self.balance);
        self.accumulated_losses = money(self.accumulated_losses);
        self.prev_stake = self.prev_stake.map(money);
        self.leg = self.leg.max(1);
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Status of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Running,
    Done,
    Skipped,
    Error,
}

impl JobStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Skipped | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Skipped => "skipped",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One armed bet attempt for one race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub event_id: String,
    pub event_name: String,
    pub track: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub error: Option<String>,
}

impl ScheduledJob {
    /// Deterministic id: stable across restarts for the same race and fire time.
    pub fn job_id_for(event: &RaceEvent, run_at: DateTime<Utc>) -> String {
        format!("{}-{}", event.id, run_at.timestamp())
    }

    pub fn new(event: &RaceEvent, run_at: DateTime<Utc>) -> Self {
        Self {
            job_id: Self::job_id_for(event, run_at),
            event_id: event.id.clone(),
            event_name: event.name.clone(),
            track: event.track.clone(),
            run_at,
            status: JobStatus::Scheduled,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bet records
// ---------------------------------------------------------------------------

/// Outcome column of a bet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetResult {
    Pending,
    Won,
    Lost,
}

impl BetResult {
    /// Single-letter code used by the journal and CSV audit.
    pub fn code(&self) -> &'static str {
        match self {
            BetResult::Pending => "P",
            BetResult::Won => "W",
            BetResult::Lost => "L",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(BetResult::Pending),
            "W" => Some(BetResult::Won),
            "L" => Some(BetResult::Lost),
            _ => None,
        }
    }
}

/// Append-only audit record for one leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetRecord {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub leg: u32,
    pub event: RaceEvent,
    pub selection: Selection,
    pub odds: Decimal,
    pub stake: Decimal,
    pub result: BetResult,
    pub profit: Decimal,
    pub balance_after: Decimal,
}

impl BetRecord {
    pub fn pending(
        job_id: &str,
        leg: u32,
        event: &RaceEvent,
        favourite: &Favourite,
        stake: Decimal,
        balance: Decimal,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id: job_id.to_string(),
            leg,
            event: event.clone(),
            selection: favourite.selection.clone(),
            odds: favourite.odds,
            stake,
            result: BetResult::Pending,
            profit: Decimal::ZERO,
            balance_after: balance,
        }
    }

    /// Finalise with a settled outcome.
    pub fn settle(&mut self, won: bool, profit: Decimal, balance_after: Decimal) {
        self.result = if won { BetResult::Won } else { BetResult::Lost };
        self.profit = profit;
        self.balance_after = balance_after;
        self.timestamp = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CHASE.
#[derive(Debug, thiserror::Error)]
pub enum ChaseError {
    #[error("Exchange error ({exchange}): {message}")]
    Exchange { exchange: String, message: String },

    #[error("Seed balance unavailable ({path}): {message}")]
    MissingSeedBalance { path: String, message: String },

    #[error("Unsupported state schema version {found} (max {supported})")]
    StateVersion { found: u32, supported: u32 },

    #[error("Wager placement failed for {event}: {message}")]
    Placement { event: String, message: String },

    #[error("Settlement for {event} not observed within {waited_secs}s")]
    SettlementTimeout { event: String, waited_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for ChaseError {
    fn from(e: anyhow::Error) -> Self {
        ChaseError::Storage(format!("{e:#}"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
