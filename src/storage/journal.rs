//! SQLite journal of scheduled jobs and bets.
//!
//! Every scheduled job gets a `schedules` row; every leg gets a `bets` row
//! written as pending *before* the wager goes out and finalised after
//! settlement, so a crash in between leaves a visible trace.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::types::{BetRecord, BetResult, JobStatus, ScheduledJob};

/// Default journal location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://chase.sqlite3";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS schedules (
        job_id     TEXT PRIMARY KEY,
        event_id   TEXT NOT NULL,
        event_name TEXT NOT NULL,
        track      TEXT NOT NULL,
        run_at     TEXT NOT NULL,
        status     TEXT NOT NULL DEFAULT 'scheduled',
        error      TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS ix_schedules_event_run ON schedules (event_id, run_at)",
    r#"CREATE TABLE IF NOT EXISTS bets (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id        TEXT NOT NULL REFERENCES schedules(job_id),
        timestamp     TEXT NOT NULL,
        event_id      TEXT NOT NULL,
        event_name    TEXT NOT NULL,
        track         TEXT NOT NULL,
        race_time     TEXT NOT NULL,
        leg           INTEGER NOT NULL,
        selection     TEXT NOT NULL,
        odds          TEXT NOT NULL,
        stake         TEXT NOT NULL,
        result        TEXT NOT NULL DEFAULT 'P',
        profit        TEXT NOT NULL DEFAULT '0',
        balance_after TEXT NOT NULL DEFAULT '0',
        updated_at    TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS ix_bets_event_time ON bets (event_id, race_time)",
];

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A bet row as read back from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalBet {
    pub id: i64,
    pub job_id: String,
    pub leg: u32,
    pub selection: String,
    pub odds: Decimal,
    pub stake: Decimal,
    pub result: BetResult,
    pub profit: Decimal,
    pub balance_after: Decimal,
}

/// Connection pool over the journal database.
pub struct Journal {
    pool: SqlitePool,
}

impl Journal {
    /// Open (creating if missing) the journal at `url`.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid journal URL: {url}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open journal {url}"))?;

        let journal = Self { pool };
        journal.initialize().await?;
        info!(url, "Journal ready");
        Ok(journal)
    }

    /// Private in-memory journal (one connection, never recycled).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory journal")?;

        let journal = Self { pool };
        journal.initialize().await?;
        Ok(journal)
    }

    async fn initialize(&self) -> Result<()> {
        for stmt in SCHEMA.iter().copied() {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to create journal schema")?;
        }
        Ok(())
    }

    /// Insert a `scheduled` row, or refresh one that has not fired yet.
    pub async fn record_schedule(&self, job: &ScheduledJob) -> Result<()> {
        let now = ts(Utc::now());
        sqlx::query(
            r#"INSERT INTO schedules (job_id, event_id, event_name, track, run_at, status, error, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(job_id) DO UPDATE SET
                   run_at = excluded.run_at,
                   updated_at = excluded.created_at
               WHERE schedules.status = 'scheduled'"#,
        )
        .bind(&job.job_id)
        .bind(&job.event_id)
        .bind(&job.event_name)
        .bind(&job.track)
        .bind(ts(job.run_at))
        .bind(job.status.as_str())
        .bind(job.error.as_deref())
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record schedule {}", job.job_id))?;

        debug!(job_id = %job.job_id, "Schedule recorded");
        Ok(())
    }

    /// Move a job to `status`, appending `error` to its detail.
    ///
    /// Terminal rows are never changed; returns whether a row was updated.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE schedules SET
                   status = ?,
                   error = CASE
                       WHEN ? IS NULL THEN error
                       WHEN error IS NULL THEN ?
                       ELSE error || char(10) || ?
                   END,
                   updated_at = ?
               WHERE job_id = ? AND status NOT IN ('done', 'skipped', 'error')"#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(error)
        .bind(error)
        .bind(ts(Utc::now()))
        .bind(job_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update schedule {job_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Current status of a job, if it has been recorded.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let row = sqlx::query("SELECT status FROM schedules WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read schedule {job_id}"))?;

        Ok(row.and_then(|r| {
            let status: String = r.get("status");
            match status.as_str() {
                "scheduled" => Some(JobStatus::Scheduled),
                "running" => Some(JobStatus::Running),
                "done" => Some(JobStatus::Done),
                "skipped" => Some(JobStatus::Skipped),
                "error" => Some(JobStatus::Error),
                _ => None,
            }
        }))
    }

    /// Write a pending bet row; returns its id.
    pub async fn create_pending_bet(&self, record: &BetRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"INSERT INTO bets (job_id, timestamp, event_id, event_name, track, race_time,
                                 leg, selection, odds, stake, result, profit, balance_after)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&record.job_id)
        .bind(ts(record.timestamp))
        .bind(&record.event.id)
        .bind(&record.event.name)
        .bind(&record.event.track)
        .bind(ts(record.event.start_time))
        .bind(record.leg as i64)
        .bind(&record.selection.name)
        .bind(record.odds.to_string())
        .bind(record.stake.to_string())
        .bind(BetResult::Pending.code())
        .bind(Decimal::ZERO.to_string())
        .bind(record.balance_after.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record pending bet for {}", record.job_id))?;

        Ok(result.last_insert_rowid())
    }

    /// Record the settled outcome of a bet.
    pub async fn finalize_bet(&self, bet_id: i64, record: &BetRecord) -> Result<()> {
        sqlx::query(
            "UPDATE bets SET odds = ?, result = ?, profit = ?, balance_after = ?, updated_at = ? WHERE id = ?",
        )
        .bind(record.odds.to_string())
        .bind(record.result.code())
        .bind(record.profit.to_string())
        .bind(record.balance_after.to_string())
        .bind(ts(Utc::now()))
        .bind(bet_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to finalise bet {bet_id}"))?;
        Ok(())
    }

    /// All bets recorded for a job, oldest first.
    pub async fn bets_for_job(&self, job_id: &str) -> Result<Vec<JournalBet>> {
        let rows = sqlx::query(
            r#"SELECT id, job_id, leg, selection, odds, stake, result, profit, balance_after
               FROM bets WHERE job_id = ? ORDER BY id"#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to read bets for {job_id}"))?;

        rows.iter().map(Self::bet_from_row).collect()
    }

    /// Bets still marked pending (placed but never settled).
    pub async fn pending_bets(&self) -> Result<Vec<JournalBet>> {
        let rows = sqlx::query(
            r#"SELECT id, job_id, leg, selection, odds, stake, result, profit, balance_after
               FROM bets WHERE result = 'P' ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read pending bets")?;

        rows.iter().map(Self::bet_from_row).collect()
    }

    fn bet_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JournalBet> {
        let dec = |col: &str| -> Result<Decimal> {
            let raw: String = row.get(col);
            Decimal::from_str(&raw).with_context(|| format!("Bad decimal in bets.{col}: {raw}"))
        };
        let code: String = row.get("result");
        let leg: i64 = row.get("leg");
        Ok(JournalBet {
            id: row.get("id"),
            job_id: row.get("job_id"),
            leg: leg as u32,
            selection: row.get("selection"),
            odds: dec("odds")?,
            stake: dec("stake")?,
            result: BetResult::from_code(&code)
                .with_context(|| format!("Bad result code in bets: {code}"))?,
            profit: dec("profit")?,
            balance_after: dec("balance_after")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
