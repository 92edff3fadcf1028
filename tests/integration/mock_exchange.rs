//! Mock exchange for integration testing.
//!
//! Provides a deterministic `RacingExchange` implementation with a
//! scripted race card: each market knows its favourite, whether the
//! favourite wins, and how many polls it stays open. Everything is
//! in-memory with no external dependencies.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chase::engine::{FixedClock, Invoker, JobBook, JobRunner, ResultPoller};
use chase::platforms::RacingExchange;
use chase::storage::{AuditLog, Journal, StateStore};
use chase::strategy::StakeCalculator;
use chase::types::*;

pub const FAVOURITE_ID: u64 = 1;
pub const OUTSIDER_ID: u64 = 2;

struct MockMarket {
    odds: Option<Decimal>,
    favourite_wins: bool,
    /// Polls answered OPEN before the market closes.
    closes_after: u32,
    polls: u32,
}

/// A scripted racing exchange.
#[derive(Default)]
pub struct MockExchange {
    card: Mutex<Vec<RaceEvent>>,
    markets: Mutex<HashMap<String, MockMarket>>,
    placed: Mutex<Vec<WagerRequest>>,
    /// If set, every call fails with this error.
    force_error: Mutex<Option<String>>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a race to the card.
    pub fn add_race(&self, event: RaceEvent, odds: Decimal, favourite_wins: bool, closes_after: u32) {
        self.markets.lock().unwrap().insert(
            event.id.clone(),
            MockMarket {
                odds: Some(odds),
                favourite_wins,
                closes_after,
                polls: 0,
            },
        );
        self.card.lock().unwrap().push(event);
    }

    /// Add a race whose book has no prices.
    pub fn add_unpriced_race(&self, event: RaceEvent) {
        self.markets.lock().unwrap().insert(
            event.id.clone(),
            MockMarket {
                odds: None,
                favourite_wins: false,
                closes_after: 0,
                polls: 0,
            },
        );
        self.card.lock().unwrap().push(event);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Every wager request received so far.
    pub fn placed(&self) -> Vec<WagerRequest> {
        self.placed.lock().unwrap().clone()
    }

    fn check_error(&self) -> Result<()> {
        match self.force_error.lock().unwrap().as_ref() {
            Some(msg) => Err(anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RacingExchange for MockExchange {
    async fn list_todays_events(&self, _tz: Tz) -> Result<Vec<RaceEvent>> {
        self.check_error()?;
        let mut card = self.card.lock().unwrap().clone();
        card.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(card)
    }

    async fn resolve_favourite(&self, event: &RaceEvent) -> Result<Option<Favourite>> {
        self.check_error()?;
        let markets = self.markets.lock().unwrap();
        let market = markets
            .get(&event.id)
            .ok_or_else(|| anyhow!("unknown market {}", event.id))?;
        Ok(market.odds.map(|odds| Favourite {
            selection: Selection {
                id: FAVOURITE_ID,
                name: format!("Fav of {}", event.id),
            },
            odds,
        }))
    }

    async fn place_wager(&self, request: &WagerRequest) -> Result<WagerReceipt> {
        self.check_error()?;
        self.placed.lock().unwrap().push(request.clone());
        Ok(WagerReceipt {
            bet_id: format!("MOCK-{}", uuid::Uuid::new_v4()),
            market_id: request.event.id.clone(),
            selection_id: request.selection.id,
            stake: request.stake,
            odds: request.odds,
            placed_at: Utc::now(),
        })
    }

    async fn poll_status(&self, event: &RaceEvent) -> Result<MarketStatus> {
        self.check_error()?;
        let mut markets = self.markets.lock().unwrap();
        let market = markets
            .get_mut(&event.id)
            .ok_or_else(|| anyhow!("unknown market {}", event.id))?;
        market.polls += 1;
        if market.polls <= market.closes_after {
            return Ok(MarketStatus::open());
        }
        let winner = if market.favourite_wins { FAVOURITE_ID } else { OUTSIDER_ID };
        Ok(MarketStatus::closed(Some(winner)))
    }
}

// ---------------------------------------------------------------------------
// Test rig
// ---------------------------------------------------------------------------

pub fn london() -> Tz {
    chrono_tz::Europe::London
}

pub fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("chase_it_{tag}_{}", uuid::Uuid::new_v4()))
}

pub fn race(id: &str, track: &str, start_time: DateTime<Utc>) -> RaceEvent {
    RaceEvent {
        id: id.to_string(),
        name: format!("Race {id}"),
        track: track.to_string(),
        start_time,
    }
}

/// Everything a chase day needs, wired to a [`MockExchange`].
pub struct Rig {
    pub exchange: Arc<MockExchange>,
    pub store: Arc<StateStore>,
    pub jobs: Arc<JobBook>,
    pub runner: Arc<JobRunner>,
    pub audit_dir: PathBuf,
}

impl Rig {
    /// Rig with a 200.00 seed bankroll; the runner's clock reads `now`.
    pub async fn new(exchange: Arc<MockExchange>, now: DateTime<Utc>) -> Self {
        let seed = temp_path("seed");
        std::fs::write(&seed, r#"{"balance": 200.00}"#).unwrap();
        let store = Arc::new(StateStore::new(temp_path("state"), seed));
        let jobs = Arc::new(JobBook::new(Arc::new(Journal::in_memory().await.unwrap())));
        let audit_dir = temp_path("audit");
        let invoker = Invoker::new(2, Duration::from_millis(1));

        let runner = JobRunner::new(
            exchange.clone(),
            store.clone(),
            jobs.clone(),
            AuditLog::new(&audit_dir, london()),
            StakeCalculator::default(),
            london(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        )
        .with_invoker(invoker.clone())
        .with_poller(ResultPoller::new(invoker, Duration::from_millis(3), None))
        .with_clock(Arc::new(FixedClock(now)));

        Self {
            exchange,
            store,
            jobs,
            runner: Arc::new(runner),
            audit_dir,
        }
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(&self.audit_dir, london())
    }

    /// Record a job for `event` and run it to completion.
    pub async fn run_race(&self, event: &RaceEvent) -> (String, JobStatus) {
        let run_at = event.start_time - chrono::Duration::seconds(60);
        let (job, _) = self.jobs.insert(event, run_at).await;
        let status = self.runner.run(&job.job_id, event).await;
        (job.job_id, status)
    }
}
