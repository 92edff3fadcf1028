//! CHASE — progressive horse-racing chase engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! validates the seed bankroll, and runs the daily scheduler until a
//! fatal error or Ctrl+C.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use chase::config::AppConfig;
use chase::engine::scheduler::Scheduler;
use chase::engine::{Invoker, JobBook, JobRunner, ResultPoller};
use chase::platforms::betfair::BetfairClient;
use chase::platforms::RacingExchange;
use chase::storage::{AuditLog, Journal, StateStore};
use chase::strategy::{EligibilityFilter, StakeCalculator};

const BANNER: &str = r#"
   ___ _  _   _   ___ ___
  / __| || | /_\ / __| __|
 | (__| __ |/ _ \\__ \ _|
  \___|_||_/_/ \_\___/___|

  Favourite chase engine v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHASE_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string());
    let cfg = if Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        warn!(path = %config_path, "Config file not found, using defaults");
        AppConfig::default()
    };

    println!("{BANNER}");

    let settings = cfg.chase.schedule_settings()?;
    let cutoff = cfg.chase.cutoff()?;
    info!(
        timezone = %settings.tz,
        daily_trigger = %settings.daily_trigger,
        cutoff = %cutoff,
        lead_secs = cfg.chase.lead_secs,
        dry_run = cfg.betfair.dry_run,
        "CHASE starting up"
    );

    // -- State -----------------------------------------------------------

    let store = Arc::new(StateStore::new(&cfg.chase.state_file, &cfg.chase.balance_file));
    let seed = store.read_seed_balance()?;
    let state = store.load().await?;
    info!(seed = %seed, state = %state, "State loaded");
    if state.is_running_race {
        warn!("State marks a race as running from a previous process; jobs will skip until the flag is cleared or the daily reset runs");
    }

    let journal = Arc::new(Journal::open(&cfg.audit.database_url).await?);
    for bet in journal.pending_bets().await? {
        warn!(job_id = %bet.job_id, leg = bet.leg, stake = %bet.stake, "Unsettled bet from a previous run");
    }

    // -- Components ------------------------------------------------------

    let filter = EligibilityFilter::load(
        &cfg.eligibility.low_win_file,
        &cfg.eligibility.track_grade_file,
    )?;

    let exchange: Arc<dyn RacingExchange> = Arc::new(BetfairClient::from_config(&cfg.betfair)?);
    if cfg.betfair.dry_run {
        warn!("Dry-run mode: orders are logged, not sent");
    }

    let invoker = Invoker::from_config(&cfg.retry);
    let jobs = Arc::new(JobBook::new(journal));
    let runner = JobRunner::new(
        exchange.clone(),
        store.clone(),
        jobs,
        AuditLog::new(&cfg.audit.results_dir, settings.tz),
        StakeCalculator::new(cfg.stake.clone()),
        settings.tz,
        cutoff,
    )
    .with_invoker(invoker.clone())
    .with_poller(ResultPoller::from_config(invoker.clone(), &cfg.polling));

    let scheduler = Scheduler::new(exchange, store.clone(), filter, Arc::new(runner), settings)
        .with_invoker(invoker);

    // -- Main loop -------------------------------------------------------

    info!("Entering scheduler loop. Press Ctrl+C to stop.");
    let result = tokio::select! {
        r = scheduler.run() => r.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received.");
            Ok(())
        }
    };

    let cancelled = scheduler.shutdown();
    if let Err(ref e) = result {
        error!(error = %e, "Scheduler stopped");
    }

    match store.load().await {
        Ok(state) => info!(cancelled_timers = cancelled, state = %state, "CHASE shut down."),
        Err(e) => error!(error = %e, "Could not read final state"),
    }

    result
}

/// Initialise the tracing subscriber with env-filter and optional JSON output.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chase=info"));

    let json_logging = std::env::var("CHASE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
