//! Daily discovery and per-race timers.
//!
//! Once a day (and immediately on a late start) the scheduler resets the
//! chase, lists the day's remaining races, filters them and arms one
//! timer per race at `start - lead`. Each timer hands its job to the
//! [`JobRunner`].

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::engine::jobs::{Insert, JobBook};
use crate::engine::retry::Invoker;
use crate::engine::runner::JobRunner;
use crate::engine::{Clock, SystemClock};
use crate::platforms::RacingExchange;
use crate::storage::StateStore;
use crate::strategy::EligibilityFilter;
use crate::types::{ChaseError, JobStatus, RaceEvent};

/// Timing settings for discovery and firing.
#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub tz: Tz,
    /// Local time of the daily reset and discovery.
    pub daily_trigger: NaiveTime,
    /// How long before the off each job fires.
    pub lead: ChronoDuration,
    /// Fires later than this after `run_at` are skipped.
    pub misfire_grace: ChronoDuration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Europe::London,
            daily_trigger: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default(),
            lead: ChronoDuration::seconds(60),
            misfire_grace: ChronoDuration::seconds(30),
        }
    }
}

/// Summary of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Whether the daily reset ran.
    pub reset: bool,
    /// Events returned by the exchange (0 when unavailable).
    pub listed: usize,
    pub filtered: usize,
    /// Events whose fire time had already passed.
    pub too_late: usize,
    /// Job ids armed in this pass.
    pub armed: Vec<String>,
    /// Jobs already running or finished, left alone.
    pub kept: usize,
    pub pruned: usize,
}

/// Next instant strictly after `now` at local time `at` in `tz`.
pub fn next_daily_fire(now: DateTime<Utc>, at: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let mut date = now.with_timezone(&tz).date_naive();
    loop {
        if let Some(candidate) = local_instant(tz, date.and_time(at)) {
            if candidate > now {
                return candidate;
            }
        }
        date = date.succ_opt().unwrap_or(date);
    }
}

fn local_instant(tz: Tz, naive: chrono::NaiveDateTime) -> Option<DateTime<Utc>> {
    // Inside a spring-forward gap the wall time does not exist; use the
    // first valid instant an hour later.
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + ChronoDuration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

struct Arm {
    handle: JoinHandle<()>,
    /// Set once by whoever gets there first: the timer firing, or a
    /// replacement/shutdown cancelling it.
    taken: Arc<AtomicBool>,
}

pub struct Scheduler {
    exchange: Arc<dyn RacingExchange>,
    invoker: Invoker,
    store: Arc<StateStore>,
    filter: EligibilityFilter,
    runner: Arc<JobRunner>,
    clock: Arc<dyn Clock>,
    settings: ScheduleSettings,
    timers: Mutex<HashMap<String, Arm>>,
}

impl Scheduler {
    pub fn new(
        exchange: Arc<dyn RacingExchange>,
        store: Arc<StateStore>,
        filter: EligibilityFilter,
        runner: Arc<JobRunner>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            exchange,
            invoker: Invoker::default(),
            store,
            filter,
            runner,
            clock: Arc::new(SystemClock),
            settings,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_invoker(mut self, invoker: Invoker) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jobs(&self) -> &Arc<JobBook> {
        self.runner.jobs()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, Arm>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Daily loop. Returns only if a discovery pass fails fatally.
    pub async fn run(&self) -> Result<(), ChaseError> {
        let settings = &self.settings;
        let mut after = self.clock.now();

        let local_now = after.with_timezone(&settings.tz).time();
        if local_now >= settings.daily_trigger {
            info!(trigger = %settings.daily_trigger, "Started after daily trigger, discovering now");
            self.discover_and_schedule(true).await?;
        }

        loop {
            let next = next_daily_fire(after, settings.daily_trigger, settings.tz);
            let wait = (next - self.clock.now()).to_std().unwrap_or_default();
            info!(
                next = %next.with_timezone(&settings.tz),
                wait_secs = wait.as_secs(),
                "Waiting for daily discovery"
            );
            sleep(wait).await;
            self.discover_and_schedule(false).await?;
            after = next;
        }
    }

    /// One discovery pass: reset, list, filter, arm.
    ///
    /// On the startup catch-up path the reset is skipped when the state was
    /// already reset today, so a mid-day restart keeps an in-progress chase.
    pub async fn discover_and_schedule(&self, catch_up: bool) -> Result<DiscoveryReport, ChaseError> {
        let settings = &self.settings;
        let now = self.clock.now();
        let today = now.with_timezone(&settings.tz).date_naive();
        let mut report = DiscoveryReport::default();

        let already_reset = catch_up && self.store.load().await?.reset_on == Some(today);
        if already_reset {
            info!(date = %today, "State already reset today, keeping chase progress");
        } else {
            self.store.reset_daily(today).await?;
            report.reset = true;
        }

        report.pruned = self.jobs().prune(today, settings.tz);
        self.timers().retain(|_, arm| !arm.handle.is_finished());

        let tz = settings.tz;
        let events = match self
            .invoker
            .call("list_todays_events", || self.exchange.list_todays_events(tz))
            .await
        {
            Some(events) => events,
            None => {
                warn!(date = %today, "Race list unavailable, nothing scheduled");
                return Ok(report);
            }
        };
        report.listed = events.len();

        for event in events {
            if let Some(reason) = self.filter.check(&event.name, &event.track) {
                info!(race = %event, reason = %reason, "Race filtered out");
                report.filtered += 1;
                continue;
            }

            let run_at = event.start_time - settings.lead;
            if run_at <= now {
                info!(race = %event, run_at = %run_at, "Fire time already passed");
                report.too_late += 1;
                continue;
            }

            let (job, outcome) = self.jobs().insert(&event, run_at).await;
            match outcome {
                Insert::Kept(status) => {
                    info!(job_id = %job.job_id, status = %status, "Job already past scheduling, left alone");
                    report.kept += 1;
                }
                Insert::Added | Insert::Replaced => {
                    self.arm(&job.job_id, event, run_at);
                    report.armed.push(job.job_id);
                }
            }
        }

        info!(
            date = %today,
            listed = report.listed,
            filtered = report.filtered,
            too_late = report.too_late,
            armed = report.armed.len(),
            kept = report.kept,
            pruned = report.pruned,
            "Discovery complete"
        );
        Ok(report)
    }

    fn arm(&self, job_id: &str, event: RaceEvent, run_at: DateTime<Utc>) {
        let taken = Arc::new(AtomicBool::new(false));
        let runner = Arc::clone(&self.runner);
        let clock = Arc::clone(&self.clock);
        let grace = self.settings.misfire_grace;
        let id = job_id.to_string();
        let flag = Arc::clone(&taken);

        let handle = tokio::spawn(async move {
            let wait = (run_at - clock.now()).to_std().unwrap_or_default();
            sleep(wait).await;
            if flag.swap(true, Ordering::SeqCst) {
                return;
            }
            fire(&runner, clock.as_ref(), grace, &id, &event, run_at).await;
        });

        let mut timers = self.timers();
        if let Some(old) = timers.insert(job_id.to_string(), Arm { handle, taken }) {
            if !old.taken.swap(true, Ordering::SeqCst) {
                old.handle.abort();
                info!(job_id, "Replaced pending timer");
            }
        }
        info!(job_id, run_at = %run_at.with_timezone(&self.settings.tz), "Job armed");
    }

    /// Number of timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.timers()
            .values()
            .filter(|arm| !arm.taken.load(Ordering::SeqCst))
            .count()
    }

    /// Cancel every timer that has not fired. Running jobs are left to finish.
    pub fn shutdown(&self) -> usize {
        let mut cancelled = 0;
        for (job_id, arm) in self.timers().drain() {
            if !arm.taken.swap(true, Ordering::SeqCst) {
                arm.handle.abort();
                cancelled += 1;
                info!(job_id = %job_id, "Timer cancelled");
            }
        }
        cancelled
    }
}

/// Fire one job, unless the timer woke too late.
async fn fire(
    runner: &JobRunner,
    clock: &dyn Clock,
    grace: ChronoDuration,
    job_id: &str,
    event: &RaceEvent,
    run_at: DateTime<Utc>,
) -> JobStatus {
    let late = clock.now() - run_at;
    if late > grace {
        warn!(job_id, late_secs = late.num_seconds(), "Missed fire window");
        let jobs = runner.jobs();
        if !jobs
            .transition_from(job_id, JobStatus::Scheduled, JobStatus::Skipped, Some("missed fire window"))
            .await
        {
            error!(job_id, "Late job was no longer scheduled");
        }
        return jobs.status(job_id).unwrap_or(JobStatus::Skipped);
    }
    runner.run(job_id, event).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
