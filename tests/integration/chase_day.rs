//! Whole-day chase scenarios against the mock exchange.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use chase::engine::scheduler::{ScheduleSettings, Scheduler};
use chase::engine::{Invoker, SystemClock};
use chase::strategy::eligibility::{DenylistEntry, GradeRules};
use chase::strategy::EligibilityFilter;
use chase::types::*;

use crate::mock_exchange::{london, race, MockExchange, Rig, FAVOURITE_ID};

/// Midday in London on the given day.
fn midday(date: chrono::NaiveDate) -> DateTime<Utc> {
    london()
        .from_local_datetime(&date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()))
        .earliest()
        .unwrap()
        .with_timezone(&Utc)
}

fn fixed_midday() -> DateTime<Utc> {
    midday(chrono::NaiveDate::from_ymd_opt(2026, 10, 17).unwrap())
}

#[tokio::test]
async fn test_loss_loss_win_recovers_and_resets() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.101", "Ascot", base + ChronoDuration::minutes(30));
    let r2 = race("1.102", "Ascot", base + ChronoDuration::minutes(60));
    let r3 = race("1.103", "Ascot", base + ChronoDuration::minutes(90));
    exchange.add_race(r1.clone(), dec!(2.0), false, 1);
    exchange.add_race(r2.clone(), dec!(3.2), false, 1);
    exchange.add_race(r3.clone(), dec!(2.0), true, 1);

    let rig = Rig::new(exchange.clone(), base).await;

    // Leg 1: 4% of 200.00
    let (j1, s1) = rig.run_race(&r1).await;
    assert_eq!(s1, JobStatus::Done);
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.leg, 2);
    assert_eq!(state.balance, dec!(192.00));
    assert_eq!(state.accumulated_losses, dec!(8.00));
    assert!(state.chase_active);

    // Leg 2 at long odds: previous stake x1.5
    let (_, s2) = rig.run_race(&r2).await;
    assert_eq!(s2, JobStatus::Done);
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.leg, 3);
    assert_eq!(state.balance, dec!(180.00));
    assert_eq!(state.accumulated_losses, dec!(20.00));

    // Leg 3 at short odds: recover losses with the profit buffer
    let (j3, s3) = rig.run_race(&r3).await;
    assert_eq!(s3, JobStatus::Done);
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.leg, 1);
    assert_eq!(state.balance, dec!(204.00));
    assert_eq!(state.accumulated_losses, dec!(0));
    assert_eq!(state.prev_stake, None);
    assert!(!state.chase_active);
    assert!(!state.is_running_race);

    let stakes: Vec<_> = exchange.placed().iter().map(|w| w.stake).collect();
    assert_eq!(stakes, vec![dec!(8.00), dec!(12.00), dec!(24.00)]);
    assert!(exchange.placed().iter().all(|w| w.selection.id == FAVOURITE_ID));
    assert!(exchange.placed().iter().all(|w| w.customer_ref.len() <= 32));

    let journal = rig.jobs.journal();
    let first = journal.bets_for_job(&j1).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].result, BetResult::Lost);
    assert_eq!(first[0].balance_after, dec!(192.00));
    let last = journal.bets_for_job(&j3).await.unwrap();
    assert_eq!(last[0].result, BetResult::Won);
    assert_eq!(last[0].profit, dec!(24.00));
    assert!(journal.pending_bets().await.unwrap().is_empty());
    assert_eq!(journal.job_status(&j3).await.unwrap(), Some(JobStatus::Done));
}

#[tokio::test]
async fn test_audit_rows_follow_the_chase() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.201", "Kempton", base + ChronoDuration::minutes(10));
    let r2 = race("1.202", "Kempton", base + ChronoDuration::minutes(40));
    exchange.add_race(r1.clone(), dec!(2.5), false, 0);
    exchange.add_race(r2.clone(), dec!(2.5), true, 0);

    let rig = Rig::new(exchange, base).await;
    rig.run_race(&r1).await;
    rig.run_race(&r2).await;

    let rows = rig.audit().read_all().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].leg, 1);
    assert_eq!(rows[0].result, "L");
    assert_eq!(rows[0].stake, "8.00");
    assert_eq!(rows[0].balance, "192.00");
    assert_eq!(rows[0].track, "Kempton");

    // 2.5 is a mid price: 8.00 x 1.65 = 13.20, winning 19.80
    assert_eq!(rows[1].leg, 2);
    assert_eq!(rows[1].result, "W");
    assert_eq!(rows[1].stake, "13.20");
    assert_eq!(rows[1].profit, "19.80");
    assert_eq!(rows[1].balance, "211.80");

    let daily = rig.audit_dir.join("2026-10-17").join("chase_bets_2026-10-17.csv");
    assert!(daily.exists());
}

#[tokio::test]
async fn test_final_leg_goes_all_in_then_stops() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.301", "York", base + ChronoDuration::minutes(5));
    let r2 = race("1.302", "York", base + ChronoDuration::minutes(35));
    exchange.add_race(r1.clone(), dec!(1.8), false, 0);
    exchange.add_race(r2.clone(), dec!(1.8), true, 0);

    let rig = Rig::new(exchange.clone(), base).await;
    {
        let mut state = ChaseState::new(dec!(340.00));
        state.leg = 6;
        state.prev_stake = Some(dec!(90.00));
        state.accumulated_losses = dec!(260.00);
        state.chase_active = true;
        rig.store.save(&state).await.unwrap();
    }

    let (_, status) = rig.run_race(&r1).await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(exchange.placed()[0].stake, dec!(340.00));
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.balance, dec!(0.00));
    assert_eq!(state.leg, 7);

    // Nothing left to stake
    let (job_id, status) = rig.run_race(&r2).await;
    assert_eq!(status, JobStatus::Skipped);
    assert_eq!(exchange.placed().len(), 1);
    assert!(rig.jobs.get(&job_id).unwrap().error.is_some());
}

#[tokio::test]
async fn test_overlapping_jobs_place_one_wager() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.401", "Newbury", base + ChronoDuration::minutes(20));
    let r2 = race("1.402", "Sandown", base + ChronoDuration::minutes(20));
    exchange.add_race(r1.clone(), dec!(2.0), true, 5);
    exchange.add_race(r2.clone(), dec!(2.0), true, 5);

    let rig = Rig::new(exchange.clone(), base).await;
    let run_at = base + ChronoDuration::minutes(19);
    let (a, _) = rig.jobs.insert(&r1, run_at).await;
    let (b, _) = rig.jobs.insert(&r2, run_at).await;

    let (sa, sb) = tokio::join!(rig.runner.run(&a.job_id, &r1), rig.runner.run(&b.job_id, &r2));

    let mut statuses = vec![sa, sb];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![JobStatus::Done, JobStatus::Skipped]);
    assert_eq!(exchange.placed().len(), 1);

    let state = rig.store.load().await.unwrap();
    assert_eq!(state.balance, dec!(208.00));
    assert!(!state.is_running_race);
}

#[tokio::test]
async fn test_exchange_outage_leaves_flag_clear() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.501", "Ayr", base + ChronoDuration::minutes(15));
    let r2 = race("1.502", "Ayr", base + ChronoDuration::minutes(45));
    exchange.add_race(r1.clone(), dec!(2.0), true, 0);
    exchange.add_race(r2.clone(), dec!(2.0), true, 0);

    let rig = Rig::new(exchange.clone(), base).await;

    exchange.set_error("exchange down");
    let (_, status) = rig.run_race(&r1).await;
    assert_eq!(status, JobStatus::Skipped);
    assert!(!rig.store.load().await.unwrap().is_running_race);

    exchange.clear_error();
    let (_, status) = rig.run_race(&r2).await;
    assert_eq!(status, JobStatus::Done);
    assert_eq!(rig.store.load().await.unwrap().balance, dec!(208.00));
}

#[tokio::test]
async fn test_unpriced_favourite_is_skipped() {
    let exchange = Arc::new(MockExchange::new());
    let base = fixed_midday();
    let r1 = race("1.601", "Bath", base + ChronoDuration::minutes(15));
    exchange.add_unpriced_race(r1.clone());

    let rig = Rig::new(exchange.clone(), base).await;
    let (_, status) = rig.run_race(&r1).await;
    assert_eq!(status, JobStatus::Skipped);
    assert!(exchange.placed().is_empty());
    assert_eq!(rig.store.load().await.unwrap().leg, 1);
}

#[tokio::test]
async fn test_scheduled_day_runs_armed_races() {
    let exchange = Arc::new(MockExchange::new());
    let now = Utc::now();
    let soon = race("1.701", "Ascot", now + ChronoDuration::milliseconds(300));
    let later = race("1.702", "Ascot", now + ChronoDuration::milliseconds(900));
    let banned = race("1.703", "Wolverhampton", now + ChronoDuration::milliseconds(600));
    let gone = race("1.704", "Ascot", now - ChronoDuration::minutes(5));
    exchange.add_race(soon.clone(), dec!(2.0), false, 1);
    exchange.add_race(later.clone(), dec!(2.0), true, 1);
    exchange.add_race(banned, dec!(2.0), true, 1);
    exchange.add_race(gone, dec!(2.0), true, 1);

    // Cutoff is judged at midday so the test is independent of wall time.
    let today = now.with_timezone(&london()).date_naive();
    let rig = Rig::new(exchange.clone(), midday(today)).await;

    let filter = EligibilityFilter::new(
        vec![DenylistEntry {
            event_name: None,
            track: Some("wolverhampton".into()),
            skip: true,
        }],
        GradeRules::default(),
    );
    let settings = ScheduleSettings {
        tz: london(),
        daily_trigger: NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
        lead: ChronoDuration::milliseconds(100),
        misfire_grace: ChronoDuration::seconds(5),
    };
    let scheduler = Scheduler::new(exchange.clone(), rig.store.clone(), filter, rig.runner.clone(), settings)
        .with_invoker(Invoker::new(1, Duration::from_millis(1)))
        .with_clock(Arc::new(SystemClock));

    let report = scheduler.discover_and_schedule(false).await.unwrap();
    assert!(report.reset);
    assert_eq!(report.listed, 4);
    assert_eq!(report.filtered, 1);
    assert_eq!(report.too_late, 1);
    assert_eq!(report.armed.len(), 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while report
        .armed
        .iter()
        .any(|id| !rig.jobs.status(id).map(|s| s.is_terminal()).unwrap_or(false))
    {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for id in &report.armed {
        assert_eq!(rig.jobs.status(id), Some(JobStatus::Done));
    }
    // Lost 8.00, then won back 8.00 x 1.2 at evens
    let stakes: Vec<_> = exchange.placed().iter().map(|w| w.stake).collect();
    assert_eq!(stakes, vec![dec!(8.00), dec!(9.60)]);
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.balance, dec!(201.60));
    assert_eq!(state.leg, 1);
    assert_eq!(state.reset_on, Some(today));
    assert_eq!(scheduler.pending_timers(), 0);
}

#[tokio::test]
async fn test_restart_midday_keeps_chase_progress() {
    let exchange = Arc::new(MockExchange::new());
    let now = Utc::now();
    let today = now.with_timezone(&london()).date_naive();
    let next = race("1.801", "Ascot", now + ChronoDuration::minutes(30));
    exchange.add_race(next, dec!(4.0), true, 0);

    let rig = Rig::new(exchange.clone(), midday(today)).await;
    {
        let mut state = ChaseState::new(dec!(180.00));
        state.leg = 3;
        state.prev_stake = Some(dec!(12.00));
        state.accumulated_losses = dec!(20.00);
        state.chase_active = true;
        state.reset_on = Some(today);
        rig.store.save(&state).await.unwrap();
    }

    let scheduler = Scheduler::new(
        exchange,
        rig.store.clone(),
        EligibilityFilter::default(),
        rig.runner.clone(),
        ScheduleSettings::default(),
    )
    .with_invoker(Invoker::new(1, Duration::from_millis(1)))
    .with_clock(Arc::new(SystemClock));

    let report = scheduler.discover_and_schedule(true).await.unwrap();
    assert!(!report.reset);
    assert_eq!(report.armed.len(), 1);
    let state = rig.store.load().await.unwrap();
    assert_eq!(state.leg, 3);
    assert_eq!(state.balance, dec!(180.00));

    assert_eq!(scheduler.shutdown(), 1);
    assert_eq!(scheduler.pending_timers(), 0);
}
