//! Executes one scheduled bet attempt end to end.
//!
//! `scheduled -> running -> {done | skipped | error}`. The pre-bet checks,
//! favourite lookup, stake sizing and claiming `is_running_race` happen in
//! one state-store critical section, so at most one wager is ever
//! outstanding. Once a job has claimed the flag, every exit path
//! (including a panic) clears it again.
//!
//! A claim belongs to the chase day it was made on. If the daily reset
//! runs while the wager is still open, the late result is journalled but
//! the new day's state is left alone.

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::engine::jobs::JobBook;
use crate::engine::poller::ResultPoller;
use crate::engine::retry::Invoker;
use crate::engine::{Clock, SystemClock};
use crate::platforms::RacingExchange;
use crate::storage::{AuditLog, StateStore};
use crate::strategy::StakeCalculator;
use crate::types::{
    BetRecord, ChaseError, ChaseState, JobStatus, RaceEvent, Settlement, WagerRequest,
};

/// Exchanges cap client references at 32 characters.
const CUSTOMER_REF_MAX: usize = 32;

/// Set once the job holds `is_running_race`: the `reset_on` day it was claimed on.
type Claim = OnceLock<Option<NaiveDate>>;

/// How a job body finished when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Wager placed and settled.
    Settled(BetRecord),
    /// Nothing was staked.
    Skipped(String),
}

pub struct JobRunner {
    exchange: Arc<dyn RacingExchange>,
    invoker: Invoker,
    poller: ResultPoller,
    store: Arc<StateStore>,
    stake: StakeCalculator,
    jobs: Arc<JobBook>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    tz: Tz,
    cutoff: NaiveTime,
}

impl JobRunner {
    pub fn new(
        exchange: Arc<dyn RacingExchange>,
        store: Arc<StateStore>,
        jobs: Arc<JobBook>,
        audit: AuditLog,
        stake: StakeCalculator,
        tz: Tz,
        cutoff: NaiveTime,
    ) -> Self {
        let invoker = Invoker::default();
        Self {
            exchange,
            poller: ResultPoller::from_config(invoker.clone(), &Default::default()),
            invoker,
            store,
            stake,
            jobs,
            audit,
            clock: Arc::new(SystemClock),
            tz,
            cutoff,
        }
    }

    pub fn with_invoker(mut self, invoker: Invoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_poller(mut self, poller: ResultPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jobs(&self) -> &Arc<JobBook> {
        &self.jobs
    }

    /// Run the job to a terminal status. Never panics, never returns an error.
    pub async fn run(&self, job_id: &str, event: &RaceEvent) -> JobStatus {
        if !self.jobs.start(job_id).await {
            warn!(job_id, "Job not runnable, ignoring fire");
            return self.jobs.status(job_id).unwrap_or(JobStatus::Error);
        }
        info!(job_id, race = %event, "Job started");

        let claim = Claim::new();
        let result = AssertUnwindSafe(self.execute(job_id, event, &claim))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ChaseError::Panicked(panic_message(panic.as_ref()))));

        match result {
            Ok(JobOutcome::Settled(record)) => {
                self.jobs.transition(job_id, JobStatus::Done, None).await;
                if let Err(e) = self.audit.append(&record) {
                    error!(job_id, error = %e, "Failed to write audit row");
                }
                info!(
                    job_id,
                    leg = record.leg,
                    selection = %record.selection.name,
                    stake = %record.stake,
                    result = record.result.code(),
                    profit = %record.profit,
                    balance = %record.balance_after,
                    "Leg settled"
                );
                JobStatus::Done
            }
            Ok(JobOutcome::Skipped(reason)) => {
                info!(job_id, race = %event, reason = %reason, "Job skipped");
                self.jobs.transition(job_id, JobStatus::Skipped, Some(&reason)).await;
                JobStatus::Skipped
            }
            Err(e) => {
                error!(job_id, race = %event, error = %e, "Job failed");
                if let Some(day) = claim.get() {
                    self.release_flag(job_id, *day).await;
                }
                self.jobs
                    .transition(job_id, JobStatus::Error, Some(&e.to_string()))
                    .await;
                JobStatus::Error
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        event: &RaceEvent,
        claim: &Claim,
    ) -> Result<JobOutcome, ChaseError> {
        let now = self.clock.now();

        let min_unit = self.stake.config().min_unit;
        let (favourite, stake, leg, balance, day) = {
            let mut state = self.store.lock().await?;

            let local = now.with_timezone(&self.tz).time();
            if state.leg <= 1 && local > self.cutoff {
                return Ok(JobOutcome::Skipped(format!(
                    "after cutoff {} with no chase in progress",
                    self.cutoff.format("%H:%M")
                )));
            }
            if state.balance < min_unit {
                return Ok(JobOutcome::Skipped(format!(
                    "balance too low ({:.2} < {min_unit})",
                    state.balance
                )));
            }
            if state.is_running_race {
                return Ok(JobOutcome::Skipped("another race is still running".to_string()));
            }

            let favourite = self
                .invoker
                .call("resolve_favourite", || self.exchange.resolve_favourite(event))
                .await
                .flatten();
            let Some(favourite) = favourite else {
                return Ok(JobOutcome::Skipped("favourite or odds unavailable".to_string()));
            };

            let stake = self.stake.next_stake(
                state.prev_stake,
                state.leg,
                favourite.odds,
                state.accumulated_losses,
                state.balance,
            );
            if stake > state.balance {
                warn!(job_id, stake = %stake, balance = %state.balance, "Stake exceeds balance");
            }

            state.is_running_race = true;
            let _ = claim.set(state.reset_on);
            state.commit()?;
            (favourite, stake, state.leg, state.balance, state.reset_on)
        };

        let mut record = BetRecord::pending(job_id, leg, event, &favourite, stake, balance);
        let bet_id = self
            .jobs
            .journal()
            .create_pending_bet(&record)
            .await
            .map_err(|e| ChaseError::Storage(format!("{e:#}")))?;

        let request = WagerRequest {
            event: event.clone(),
            selection: favourite.selection.clone(),
            stake,
            odds: favourite.odds,
            customer_ref: job_id.chars().take(CUSTOMER_REF_MAX).collect(),
        };
        info!(
            job_id,
            leg,
            selection = %favourite.selection.name,
            odds = %favourite.odds,
            stake = %stake,
            "Placing wager"
        );
        let receipt = self
            .invoker
            .call("place_wager", || self.exchange.place_wager(&request))
            .await
            .ok_or_else(|| ChaseError::Placement {
                event: event.to_string(),
                message: "exchange unavailable after retries".to_string(),
            })?;
        info!(job_id, receipt = %receipt, "Wager placed");
        if receipt.odds != favourite.odds {
            info!(job_id, quoted = %favourite.odds, matched = %receipt.odds, "Matched at a different price");
        }
        record.odds = receipt.odds;

        let settlement = self
            .poller
            .await_result(self.exchange.as_ref(), event, &favourite.selection)
            .await;
        let won = match settlement {
            Settlement::Won => true,
            Settlement::Lost => false,
            Settlement::Unknown => {
                return Err(ChaseError::SettlementTimeout {
                    event: event.to_string(),
                    waited_secs: self.poller.max_wait().map(|d| d.as_secs()).unwrap_or(0),
                });
            }
        };

        let (profit, balance_after) = {
            let mut state = self.store.lock().await?;
            if state.reset_on != day {
                warn!(
                    job_id,
                    claimed_on = ?day,
                    reset_on = ?state.reset_on,
                    "Chase was reset while the wager was open, state left unchanged"
                );
                (ChaseState::leg_profit(stake, record.odds, won), state.balance)
            } else {
                let profit = state.apply_settlement(stake, record.odds, won);
                state.commit()?;
                (profit, state.balance)
            }
        };

        record.settle(won, profit, balance_after);
        if let Err(e) = self.jobs.journal().finalize_bet(bet_id, &record).await {
            error!(job_id, bet_id, error = %e, "Failed to finalise bet in journal");
        }
        Ok(JobOutcome::Settled(record))
    }

    async fn release_flag(&self, job_id: &str, day: Option<NaiveDate>) {
        let released = async {
            let mut state = self.store.lock().await?;
            if state.reset_on != day {
                // The flag now belongs to the new day.
                return Ok(false);
            }
            state.is_running_race = false;
            state.commit().map(|()| true)
        }
        .await;
        match released {
            Ok(true) => info!(job_id, "Running-race flag cleared"),
            Ok(false) => warn!(job_id, "Chase was reset since the claim, flag left as is"),
            Err(e) => error!(job_id, error = %e, "Failed to clear running-race flag"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
