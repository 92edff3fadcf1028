//! CSV audit trail of settled legs.
//!
//! Each settled leg is appended to a per-day file
//! (`<dir>/<YYYY-MM-DD>/chase_bets_<YYYY-MM-DD>.csv`) and to the all-time
//! file (`<dir>/chase_results.csv`). Headers are written when a file is
//! created.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::BetRecord;

/// Default results directory.
pub const DEFAULT_RESULTS_DIR: &str = "chase_results";

const ALL_TIME_FILE: &str = "chase_results.csv";

/// One row of the audit CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub timestamp: String,
    pub job_id: String,
    pub leg: u32,
    pub event: String,
    pub track: String,
    pub selection: String,
    pub odds: String,
    pub stake: String,
    pub result: String,
    pub profit: String,
    pub balance: String,
}

impl AuditRow {
    pub fn from_record(record: &BetRecord, tz: Tz) -> Self {
        Self {
            timestamp: record.timestamp.with_timezone(&tz).to_rfc3339(),
            job_id: record.job_id.clone(),
            leg: record.leg,
            event: record.event.name.clone(),
            track: record.event.track.clone(),
            selection: record.selection.name.clone(),
            odds: record.odds.to_string(),
            stake: format!("{:.2}", record.stake),
            result: record.result.code().to_string(),
            profit: format!("{:.2}", record.profit),
            balance: format!("{:.2}", record.balance_after),
        }
    }
}

/// Appends settled legs to the CSV files.
pub struct AuditLog {
    dir: PathBuf,
    tz: Tz,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, tz: Tz) -> Self {
        Self { dir: dir.into(), tz }
    }

    /// Path of the per-day file for the local date of `record`.
    pub fn daily_path(&self, record: &BetRecord) -> PathBuf {
        let day = record.timestamp.with_timezone(&self.tz).format("%Y-%m-%d").to_string();
        self.dir.join(&day).join(format!("chase_bets_{day}.csv"))
    }

    pub fn all_time_path(&self) -> PathBuf {
        self.dir.join(ALL_TIME_FILE)
    }

    /// Append one settled leg to both files.
    pub fn append(&self, record: &BetRecord) -> Result<()> {
        let row = AuditRow::from_record(record, self.tz);
        let daily = self.daily_path(record);
        append_row(&daily, &row)?;
        append_row(&self.all_time_path(), &row)?;
        debug!(job_id = %row.job_id, path = %daily.display(), "Audit row written");
        Ok(())
    }

    /// Read back every row of the all-time file.
    pub fn read_all(&self) -> Result<Vec<AuditRow>> {
        let path = self.all_time_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open audit file {}", path.display()))?;
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<AuditRow>, _>>()
            .with_context(|| format!("Failed to parse audit file {}", path.display()))
    }
}

fn append_row(path: &Path, row: &AuditRow) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create audit directory {}", parent.display()))?;
    }
    let write_header = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open audit file {}", path.display()))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(write_header)
        .from_writer(file);
    writer
        .serialize(row)
        .with_context(|| format!("Failed to write audit row to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush audit file {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
