//! Waits for a race to settle.

use serde::Deserialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::engine::retry::Invoker;
use crate::platforms::RacingExchange;
use crate::types::{MarketState, RaceEvent, Selection, Settlement};

/// Polling settings (`[polling]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: f64,
    /// No limit when unset.
    pub max_wait_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30.0,
            max_wait_secs: None,
        }
    }
}

/// Polls market status until the market closes.
#[derive(Debug, Clone)]
pub struct ResultPoller {
    invoker: Invoker,
    interval: Duration,
    max_wait: Option<Duration>,
}

impl ResultPoller {
    pub fn new(invoker: Invoker, interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            invoker,
            interval,
            max_wait,
        }
    }

    pub fn from_config(invoker: Invoker, config: &PollingConfig) -> Self {
        let interval = if config.interval_secs.is_finite() && config.interval_secs > 0.0 {
            Duration::from_secs_f64(config.interval_secs)
        } else {
            Duration::from_secs(30)
        };
        Self::new(invoker, interval, config.max_wait_secs.map(Duration::from_secs))
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait
    }

    /// Block until the market is closed and report whether `selection` won.
    ///
    /// Returns `Settlement::Unknown` only when a maximum wait is configured
    /// and it elapses first.
    pub async fn await_result(
        &self,
        exchange: &dyn RacingExchange,
        event: &RaceEvent,
        selection: &Selection,
    ) -> Settlement {
        let started = Instant::now();
        let mut polls: u64 = 0;

        loop {
            polls += 1;
            let status = self
                .invoker
                .call("poll_status", || exchange.poll_status(event))
                .await;

            match status {
                Some(status) if status.state == MarketState::Closed => {
                    let won = status.winner == Some(selection.id);
                    let settlement = if won { Settlement::Won } else { Settlement::Lost };
                    info!(
                        market = %event.id,
                        selection = %selection.name,
                        winner = ?status.winner,
                        polls,
                        result = %settlement,
                        "Market settled"
                    );
                    return settlement;
                }
                Some(status) => {
                    debug!(market = %event.id, state = %status.state, polls, "Awaiting result");
                }
                None => {
                    warn!(market = %event.id, polls, "Market status unavailable, still waiting");
                }
            }

            if let Some(max_wait) = self.max_wait {
                if started.elapsed() + self.interval > max_wait {
                    warn!(
                        market = %event.id,
                        waited_secs = started.elapsed().as_secs(),
                        "Settlement wait exhausted"
                    );
                    return Settlement::Unknown;
                }
            }

            sleep(self.interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
