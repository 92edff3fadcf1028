//! Chase state persistence.
//!
//! The state file is the only source of truth for resuming after a
//! restart, so every save goes through write-temp-then-rename. All
//! read-modify-write cycles happen under one async mutex; holders get a
//! [`StateGuard`] and call [`StateGuard::commit`] to persist.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::types::{ChaseError, ChaseState, STATE_VERSION};

/// Default state file path.
pub const DEFAULT_STATE_FILE: &str = "chase_state.json";

/// Default seed balance file path.
pub const DEFAULT_BALANCE_FILE: &str = "bank_balance.json";

#[derive(Debug, Deserialize)]
struct SeedFile {
    balance: Option<Decimal>,
}

/// Single-writer store for the chase state file.
pub struct StateStore {
    path: PathBuf,
    seed_path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, seed_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            seed_path: seed_path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the configured starting bankroll.
    ///
    /// This is re-read on every daily reset; a missing or malformed file
    /// is fatal for the caller.
    pub fn read_seed_balance(&self) -> Result<Decimal, ChaseError> {
        let path = self.seed_path.display().to_string();
        let missing = |message: String| ChaseError::MissingSeedBalance {
            path: path.clone(),
            message,
        };

        let raw = std::fs::read_to_string(&self.seed_path).map_err(|e| missing(e.to_string()))?;
        let seed: SeedFile = serde_json::from_str(&raw).map_err(|e| missing(e.to_string()))?;
        let balance = seed
            .balance
            .ok_or_else(|| missing("missing 'balance' key".to_string()))?;
        if balance < Decimal::ZERO {
            return Err(missing(format!("negative balance {balance}")));
        }
        Ok(crate::types::money(balance))
    }

    /// Lock the store for a read-modify-write cycle.
    pub async fn lock(&self) -> Result<StateGuard<'_>, ChaseError> {
        let guard = self.lock.lock().await;
        let state = self.read_or_seed()?;
        Ok(StateGuard {
            store: self,
            _guard: guard,
            state,
        })
    }

    /// Last persisted snapshot, or a fresh state seeded from the balance file.
    pub async fn load(&self) -> Result<ChaseState, ChaseError> {
        let _guard = self.lock.lock().await;
        self.read_or_seed()
    }

    /// Persist a full snapshot.
    pub async fn save(&self, state: &ChaseState) -> Result<(), ChaseError> {
        let _guard = self.lock.lock().await;
        self.write_atomic(state)
    }

    /// Start a new day: back to leg 1 on the configured seed bankroll.
    ///
    /// Idempotent. The prior day's ending balance is discarded.
    pub async fn reset_daily(&self, today: NaiveDate) -> Result<ChaseState, ChaseError> {
        let _guard = self.lock.lock().await;
        let seed = self.read_seed_balance()?;

        if let Ok(Some(previous)) = self.read_snapshot() {
            if previous.is_running_race {
                warn!(state = %previous, "Daily reset while a race was marked running");
            }
        }

        let mut state = ChaseState::new(seed);
        state.reset_on = Some(today);
        self.write_atomic(&state)?;

        info!(balance = %state.balance, date = %today, "Daily reset");
        Ok(state)
    }

    fn read_or_seed(&self) -> Result<ChaseState, ChaseError> {
        match self.read_snapshot()? {
            Some(state) => Ok(state),
            None => {
                let state = ChaseState::new(self.read_seed_balance()?);
                info!(
                    path = %self.path.display(),
                    balance = %state.balance,
                    "No saved state found, seeding from balance file"
                );
                Ok(state)
            }
        }
    }

    fn read_snapshot(&self) -> Result<Option<ChaseState>, ChaseError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            ChaseError::Storage(format!("Failed to read state from {}: {e}", self.path.display()))
        })?;
        let mut state: ChaseState = serde_json::from_str(&raw).map_err(|e| {
            ChaseError::Storage(format!("Failed to parse state from {}: {e}", self.path.display()))
        })?;
        if state.version > STATE_VERSION {
            return Err(ChaseError::StateVersion {
                found: state.version,
                supported: STATE_VERSION,
            });
        }
        state.version = STATE_VERSION;
        state.normalise();
        Ok(Some(state))
    }

    fn write_atomic(&self, state: &ChaseState) -> Result<(), ChaseError> {
        let storage = |what: &str, e: std::io::Error| {
            ChaseError::Storage(format!("Failed to {what} {}: {e}", self.path.display()))
        };

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ChaseError::Storage(format!("Failed to serialise chase state: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| storage("create directory for", e))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file = std::fs::File::create(&tmp).map_err(|e| storage("create temp file for", e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| storage("write temp file for", e))?;
            file.sync_all().map_err(|e| storage("sync temp file for", e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| storage("replace", e))?;

        debug!(path = %self.path.display(), state = %state, "State saved");
        Ok(())
    }
}

/// Exclusive access to the chase state until dropped.
pub struct StateGuard<'a> {
    store: &'a StateStore,
    _guard: MutexGuard<'a, ()>,
    state: ChaseState,
}

impl StateGuard<'_> {
    /// Persist the current in-memory state.
    pub fn commit(&self) -> Result<(), ChaseError> {
        self.store.write_atomic(&self.state)
    }
}

impl Deref for StateGuard<'_> {
    type Target = ChaseState;

    fn deref(&self) -> &ChaseState {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut ChaseState {
        &mut self.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn temp_path(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("chase_test_{tag}_{}.json", uuid::Uuid::new_v4()));
        p
    }

    fn store_with_seed(balance: &str) -> StateStore {
        let seed = temp_path("seed");
        std::fs::write(&seed, format!(r#"{{"balance": {balance}}}"#)).unwrap();
        StateStore::new(temp_path("state"), seed)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    #[tokio::test]
    async fn test_load_seeds_fresh_state() {
        let store = store_with_seed("200.0");
        let state = store.load().await.unwrap();
        assert_eq!(state.balance, dec!(200));
        assert_eq!(state.leg, 1);
        assert!(!state.is_running_race);
        // Seeding alone does not write the file.
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = store_with_seed("200.0");
        let mut state = ChaseState::new(dec!(192));
        state.leg = 2;
        state.accumulated_losses = dec!(8);
        state.prev_stake = Some(dec!(8));
        state.chase_active = true;
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_save_leaves_no_temp_file() {
        let store = store_with_seed("50");
        store.save(&ChaseState::new(dec!(50))).await.unwrap();
        let mut tmp = store.path().to_path_buf().into_os_string();
        tmp.push(".tmp");
        assert!(store.path().exists());
        assert!(!PathBuf::from(tmp).exists());
    }

    #[tokio::test]
    async fn test_missing_seed_is_error() {
        let store = StateStore::new(temp_path("state"), temp_path("nope"));
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ChaseError::MissingSeedBalance { .. }));
    }

    #[tokio::test]
    async fn test_seed_without_balance_key_is_error() {
        let seed = temp_path("seed");
        std::fs::write(&seed, r#"{"bank": 10}"#).unwrap();
        let store = StateStore::new(temp_path("state"), seed);
        assert!(matches!(
            store.read_seed_balance(),
            Err(ChaseError::MissingSeedBalance { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_daily_reseeds_from_config() {
        let store = store_with_seed("200.0");
        let mut state = ChaseState::new(dec!(150));
        state.leg = 4;
        state.accumulated_losses = dec!(50);
        state.prev_stake = Some(dec!(20));
        state.chase_active = true;
        state.is_running_race = true;
        store.save(&state).await.unwrap();

        let reset = store.reset_daily(today()).await.unwrap();
        assert_eq!(reset.balance, dec!(200));
        assert_eq!(reset.leg, 1);
        assert_eq!(reset.accumulated_losses, Decimal::ZERO);
        assert_eq!(reset.prev_stake, None);
        assert!(!reset.chase_active);
        assert!(!reset.is_running_race);
        assert_eq!(reset.reset_on, Some(today()));
        assert_eq!(store.load().await.unwrap(), reset);
    }

    #[tokio::test]
    async fn test_reset_daily_idempotent() {
        let store = store_with_seed("75.5");
        let first = store.reset_daily(today()).await.unwrap();
        let second = store.reset_daily(today()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.balance, dec!(75.50));
    }

    #[tokio::test]
    async fn test_future_version_rejected() {
        let store = store_with_seed("10");
        std::fs::write(
            store.path(),
            r#"{"version": 99, "balance": 1, "leg": 1, "accumulated_losses": 0,
                "prev_stake": null, "chase_active": false, "is_running_race": false}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load().await,
            Err(ChaseError::StateVersion { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_guard_commit_persists() {
        let store = store_with_seed("100");
        {
            let mut guard = store.lock().await.unwrap();
            guard.is_running_race = true;
            guard.commit().unwrap();
        }
        assert!(store.load().await.unwrap().is_running_race);
    }

    #[tokio::test]
    async fn test_guard_without_commit_discards() {
        let store = store_with_seed("100");
        store.save(&ChaseState::new(dec!(100))).await.unwrap();
        {
            let mut guard = store.lock().await.unwrap();
            guard.leg = 5;
        }
        assert_eq!(store.load().await.unwrap().leg, 1);
    }

    #[tokio::test]
    async fn test_guard_serialises_writers() {
        let store = Arc::new(store_with_seed("100"));
        store.save(&ChaseState::new(dec!(100))).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = store.lock().await.unwrap();
                guard.leg += 1;
                guard.commit().unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.load().await.unwrap().leg, 21);
    }
}
