//! Race eligibility rules.
//!
//! Two rule sources decide whether a race is skipped:
//! - a denylist of low-win races/venues (`low_win_races.json`)
//! - per-track quality grades (`track_grades.json`), either as a mapping
//!   `{ "Track": { "grade": "C", "skip": true } }` or a list
//!   `[{ "track": "Track", "grade": "C", "skip": true }]`
//!
//! Track names match case-insensitively by substring so "Ascot" also
//! covers "Ascot (AW)". Event names match exactly.
//!
//! The files are hand-edited, so loading is lenient: a value or row that
//! is not a skip-flagged object (or `true`) is no rule, not an error.
//! Only unreadable or non-JSON files fail.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

/// One row of the low-win denylist.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DenylistEntry {
    #[serde(default, alias = "race_name")]
    pub event_name: Option<String>,
    #[serde(default, alias = "venue")]
    pub track: Option<String>,
    #[serde(default)]
    pub skip: bool,
}

/// The denylist file: an array of rows. Rows that are not well-formed
/// objects carry no rule and are dropped.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "Value")]
pub struct Denylist(pub Vec<DenylistEntry>);

impl From<Value> for Denylist {
    fn from(raw: Value) -> Self {
        let rows = match raw {
            Value::Array(rows) => rows,
            other => {
                warn!(kind = json_kind(&other), "Low win list is not an array, no rules applied");
                return Denylist::default();
            }
        };
        Denylist(rows.into_iter().filter_map(|row| lenient_row(row, "low win")).collect())
    }
}

/// Value side of the mapping form of track grades.
///
/// Only `true` or an object with `"skip": true` is a rule; any other
/// value (a grade letter, a number) is informational.
#[derive(Debug, Clone, PartialEq)]
pub enum GradeValue {
    Flag(bool),
    Detail { grade: Option<Value>, skip: bool },
    Other(Value),
}

impl From<Value> for GradeValue {
    fn from(raw: Value) -> Self {
        match raw {
            Value::Bool(flag) => GradeValue::Flag(flag),
            Value::Object(mut map) => GradeValue::Detail {
                grade: map.remove("grade"),
                skip: map.get("skip").and_then(Value::as_bool).unwrap_or(false),
            },
            other => GradeValue::Other(other),
        }
    }
}

impl GradeValue {
    fn skip(&self) -> bool {
        match self {
            GradeValue::Flag(skip) => *skip,
            GradeValue::Detail { skip, .. } => *skip,
            GradeValue::Other(_) => false,
        }
    }
}

/// Row of the list form of track grades.
#[derive(Debug, Clone, Deserialize)]
pub struct GradeEntry {
    #[serde(default, alias = "venue")]
    pub track: Option<String>,
    #[serde(default)]
    pub grade: Option<Value>,
    #[serde(default)]
    pub skip: bool,
}

/// Track grade rules in either supported shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "Value")]
pub enum GradeRules {
    Mapping(BTreeMap<String, GradeValue>),
    List(Vec<GradeEntry>),
}

impl Default for GradeRules {
    fn default() -> Self {
        GradeRules::List(Vec::new())
    }
}

impl From<Value> for GradeRules {
    fn from(raw: Value) -> Self {
        match raw {
            Value::Object(map) => GradeRules::Mapping(
                map.into_iter()
                    .map(|(track, value)| (track, GradeValue::from(value)))
                    .collect(),
            ),
            Value::Array(rows) => GradeRules::List(
                rows.into_iter()
                    .filter_map(|row| lenient_row(row, "track grade"))
                    .collect(),
            ),
            other => {
                warn!(kind = json_kind(&other), "Track grades are neither a mapping nor a list, no rules applied");
                GradeRules::default()
            }
        }
    }
}

fn lenient_row<T: serde::de::DeserializeOwned>(row: Value, list: &str) -> Option<T> {
    if !row.is_object() {
        debug!(list, kind = json_kind(&row), "Ignoring non-object rule row");
        return None;
    }
    match serde_json::from_value(row) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(list, error = %e, "Ignoring malformed rule row");
            None
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Why a race was left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Matched a denylist row on the event name.
    DenylistedEvent(String),
    /// Matched a denylist row on the track.
    DenylistedTrack(String),
    /// Track is graded as not worth betting.
    TrackGrade(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DenylistedEvent(e) => write!(f, "low win list (event '{e}')"),
            SkipReason::DenylistedTrack(t) => write!(f, "low win list (track '{t}')"),
            SkipReason::TrackGrade(t) => write!(f, "track grade ('{t}')"),
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

fn normalise_track(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Decide whether a race should be skipped. First matching rule wins.
pub fn should_skip(
    event_name: &str,
    track_name: &str,
    denylist: &[DenylistEntry],
    grades: &GradeRules,
) -> Option<SkipReason> {
    let event = event_name.trim();
    let track = normalise_track(track_name);

    for row in denylist.iter().filter(|r| r.skip) {
        let row_event = row.event_name.as_deref().map(str::trim).unwrap_or("");
        if !row_event.is_empty() && row_event == event {
            return Some(SkipReason::DenylistedEvent(row_event.to_string()));
        }
        let row_track = row.track.as_deref().map(normalise_track).unwrap_or_default();
        if !row_track.is_empty() && track.contains(&row_track) {
            return Some(SkipReason::DenylistedTrack(row_track));
        }
    }

    match grades {
        GradeRules::Mapping(map) => {
            for (key, value) in map {
                let key = normalise_track(key);
                if !key.is_empty() && track.contains(&key) && value.skip() {
                    return Some(SkipReason::TrackGrade(key));
                }
            }
        }
        GradeRules::List(rows) => {
            for row in rows.iter().filter(|r| r.skip) {
                let key = row.track.as_deref().map(normalise_track).unwrap_or_default();
                if !key.is_empty() && track.contains(&key) {
                    return Some(SkipReason::TrackGrade(key));
                }
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Loaded eligibility rules.
#[derive(Debug, Clone, Default)]
pub struct EligibilityFilter {
    denylist: Vec<DenylistEntry>,
    grades: GradeRules,
}

impl EligibilityFilter {
    pub fn new(denylist: Vec<DenylistEntry>, grades: GradeRules) -> Self {
        Self { denylist, grades }
    }

    /// Load both rule files. A missing file means "no rules of that kind".
    pub fn load(low_win_path: &Path, track_grade_path: &Path) -> Result<Self> {
        let denylist = read_optional_json::<Denylist>(low_win_path)?
            .map(|list| list.0)
            .unwrap_or_default();
        let grades: GradeRules = read_optional_json(track_grade_path)?.unwrap_or_default();

        info!(
            denylist = denylist.iter().filter(|r| r.skip).count(),
            grade_rules = match &grades {
                GradeRules::Mapping(m) => m.len(),
                GradeRules::List(l) => l.len(),
            },
            "Eligibility rules loaded"
        );

        Ok(Self { denylist, grades })
    }

    /// `Some(reason)` if the race should be skipped.
    pub fn check(&self, event_name: &str, track_name: &str) -> Option<SkipReason> {
        let reason = should_skip(event_name, track_name, &self.denylist, &self.grades);
        if let Some(ref r) = reason {
            debug!(event = event_name, track = track_name, reason = %r, "Race filtered");
        }
        reason
    }
}

fn read_optional_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        warn!(path = %path.display(), "Rule file not found, no rules applied");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rule file {}", path.display()))?;
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse rule file {}", path.display()))?;
    Ok(Some(parsed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
