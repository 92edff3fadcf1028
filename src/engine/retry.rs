//! Bounded retry with exponential backoff around exchange calls.
//!
//! Exhaustion is not an error to the caller: it yields `None`, meaning
//! "unavailable", and each caller decides what that means for its job.

use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

/// Retry settings (`[retry]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_secs: 2.0,
        }
    }
}

/// Wraps fallible async calls with retries.
#[derive(Debug, Clone)]
pub struct Invoker {
    attempts: u32,
    initial_delay: Duration,
}

impl Default for Invoker {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl Invoker {
    pub fn new(attempts: u32, initial_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let secs = if config.initial_delay_secs.is_finite() {
            config.initial_delay_secs.max(0.0)
        } else {
            0.0
        };
        Self::new(config.attempts, Duration::from_secs_f64(secs))
    }

    /// Run `f` up to `attempts` times.
    ///
    /// Sleeps between attempts only, doubling the delay each time.
    pub async fn call<T, E, F, Fut>(&self, op: &str, mut f: F) -> Option<T>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut delay = self.initial_delay;

        for attempt in 1..=self.attempts {
            match f().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(
                        op,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Call failed"
                    );
                    if attempt < self.attempts {
                        sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
            }
        }

        error!(op, attempts = self.attempts, "Giving up, treating as unavailable");
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
