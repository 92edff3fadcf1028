//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults, so a partial (or empty) file is valid.
//! Secrets (Betfair credentials) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveTime};
use chrono_tz::Tz;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::poller::PollingConfig;
use crate::engine::retry::RetryConfig;
use crate::engine::scheduler::ScheduleSettings;
use crate::storage::audit::DEFAULT_RESULTS_DIR;
use crate::storage::journal::DEFAULT_DATABASE_URL;
use crate::storage::state::{DEFAULT_BALANCE_FILE, DEFAULT_STATE_FILE};
use crate::strategy::StakeConfig;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub chase: ChaseConfig,
    pub stake: StakeConfig,
    pub eligibility: EligibilityConfig,
    pub polling: PollingConfig,
    pub retry: RetryConfig,
    pub betfair: BetfairConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChaseConfig {
    /// IANA zone for the trading day, e.g. "Europe/London".
    pub timezone: String,
    /// Local "HH:MM" of the daily reset and discovery.
    pub daily_trigger: String,
    /// Local "HH:MM" after which no new chase is started.
    pub cutoff_time: String,
    pub lead_secs: u64,
    pub misfire_grace_secs: u64,
    pub state_file: PathBuf,
    pub balance_file: PathBuf,
}

impl Default for ChaseConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/London".to_string(),
            daily_trigger: "05:00".to_string(),
            cutoff_time: "18:00".to_string(),
            lead_secs: 60,
            misfire_grace_secs: 30,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            balance_file: PathBuf::from(DEFAULT_BALANCE_FILE),
        }
    }
}

impl ChaseConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid timezone '{}': {e}", self.timezone))
    }

    pub fn daily_trigger_time(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.daily_trigger).context("Invalid chase.daily_trigger")
    }

    pub fn cutoff(&self) -> Result<NaiveTime> {
        parse_hhmm(&self.cutoff_time).context("Invalid chase.cutoff_time")
    }

    pub fn schedule_settings(&self) -> Result<ScheduleSettings> {
        Ok(ScheduleSettings {
            tz: self.tz()?,
            daily_trigger: self.daily_trigger_time()?,
            lead: ChronoDuration::seconds(i64::try_from(self.lead_secs).unwrap_or(i64::MAX)),
            misfire_grace: ChronoDuration::seconds(
                i64::try_from(self.misfire_grace_secs).unwrap_or(i64::MAX),
            ),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EligibilityConfig {
    pub low_win_file: PathBuf,
    pub track_grade_file: PathBuf,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            low_win_file: PathBuf::from("low_win_races.json"),
            track_grade_file: PathBuf::from("track_grades.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BetfairConfig {
    pub app_key_env: String,
    pub username_env: String,
    pub password_env: String,
    /// Log orders instead of sending them.
    pub dry_run: bool,
    pub countries: Vec<String>,
}

impl Default for BetfairConfig {
    fn default() -> Self {
        Self {
            app_key_env: "BETFAIR_APP_KEY".to_string(),
            username_env: "BETFAIR_USERNAME".to_string(),
            password_env: "BETFAIR_PASSWORD".to_string(),
            dry_run: true,
            countries: vec!["GB".to_string(), "IE".to_string()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub results_dir: PathBuf,
    pub database_url: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            database_url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .with_context(|| format!("expected HH:MM, got '{raw}'"))
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse and validate TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that is only interpreted later.
    pub fn validate(&self) -> Result<()> {
        self.chase.schedule_settings()?;
        self.chase.cutoff()?;
        if self.retry.attempts == 0 {
            anyhow::bail!("retry.attempts must be at least 1");
        }
        if self.stake.final_leg < 2 {
            anyhow::bail!("stake.final_leg must be at least 2");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
