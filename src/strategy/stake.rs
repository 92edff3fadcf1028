//! Chase stake sizing.
//!
//! Maps (leg, odds, accumulated losses, balance) to the stake for the next
//! leg. Every result is rounded *up* to the next whole penny so a winning
//! leg never falls short of recovering the chase.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::debug;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Stake sizing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StakeConfig {
    /// Smallest stake ever returned.
    pub min_unit: Decimal,
    /// Fraction of the (capped) bankroll staked on leg 1.
    pub first_leg_fraction: Decimal,
    /// Bankroll above this is ignored when sizing.
    pub account_cap: Decimal,
    /// Leg on which the whole (capped) bankroll goes in.
    pub final_leg: u32,
    pub high_odds_threshold: Decimal,
    pub high_multiplier: Decimal,
    pub mid_odds_threshold: Decimal,
    pub mid_multiplier: Decimal,
    /// Required profit as a multiple of accumulated losses on short odds.
    pub profit_buffer: Decimal,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            min_unit: dec!(0.01),
            first_leg_fraction: dec!(0.04),
            account_cap: dec!(5000),
            final_leg: 6,
            high_odds_threshold: dec!(3.0),
            high_multiplier: dec!(1.50),
            mid_odds_threshold: dec!(2.25),
            mid_multiplier: dec!(1.65),
            profit_buffer: dec!(1.20),
        }
    }
}

/// Round up to the next whole penny.
pub fn ceil_penny(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity)
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

pub struct StakeCalculator {
    config: StakeConfig,
}

impl StakeCalculator {
    pub fn new(config: StakeConfig) -> Self {
        Self { config }
    }

    /// Access the stake configuration.
    pub fn config(&self) -> &StakeConfig {
        &self.config
    }

    /// Stake for the next leg.
    ///
    /// Balance sufficiency is not checked here; the job runner skips
    /// before calling when the bankroll is below the minimum unit.
    pub fn next_stake(
        &self,
        prev_stake: Option<Decimal>,
        leg: u32,
        next_odds: Decimal,
        accumulated_losses: Decimal,
        balance: Decimal,
    ) -> Decimal {
        let cfg = &self.config;
        let capped = balance.min(cfg.account_cap);
        let prev = prev_stake.unwrap_or(cfg.min_unit);

        let stake = if leg <= 1 {
            let first = ceil_penny(capped * cfg.first_leg_fraction).max(cfg.min_unit);
            if balance >= cfg.min_unit {
                first.min(balance)
            } else {
                first
            }
        } else if leg == cfg.final_leg {
            capped
        } else if leg < cfg.final_leg {
            let raw = if next_odds >= cfg.high_odds_threshold {
                prev * cfg.high_multiplier
            } else if next_odds >= cfg.mid_odds_threshold {
                prev * cfg.mid_multiplier
            } else if next_odds <= Decimal::ONE {
                cfg.min_unit
            } else {
                accumulated_losses * cfg.profit_buffer / (next_odds - Decimal::ONE)
            };
            ceil_penny(raw)
        } else {
            // Past the final leg the chase just repeats the last stake.
            ceil_penny(prev)
        };

        let stake = stake.max(cfg.min_unit);

        debug!(
            leg,
            odds = %next_odds,
            prev_stake = ?prev_stake,
            losses = %accumulated_losses,
            balance = %balance,
            stake = %stake,
            "Stake sized"
        );

        stake
    }
}

impl Default for StakeCalculator {
    fn default() -> Self {
        Self::new(StakeConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
