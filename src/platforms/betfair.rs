//! Betfair Exchange integration.
//!
//! Horse-racing WIN markets over the Betfair Exchange API (JSON-RPC over
//! REST).
//!
//! API docs: https://docs.developer.betfair.com/display/1smk3cen4v3lu3yomq5qye0ni/API+Overview
//! Betting API base: https://api.betfair.com/exchange/betting/rest/v1.0/
//! Auth: https://identitysso.betfair.com/api/login
//!
//! Auth requires: App Key + session token (obtained via username/password login).
//! Headers: `X-Application: {app_key}`, `X-Authentication: {session_token}`
//!
//! Prices are decimal odds. Orders are BACK / LIMIT / LAPSE at the quoted
//! price, tagged with a `customerRef` so a retried placement is
//! de-duplicated by the exchange.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use rust_decimal::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::RacingExchange;
use crate::config::{AppConfig, BetfairConfig};
use crate::types::{
    d, Favourite, MarketState, MarketStatus, RaceEvent, Selection, WagerReceipt, WagerRequest,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const AUTH_URL: &str = "https://identitysso.betfair.com/api/login";
const BETTING_URL: &str = "https://api.betfair.com/exchange/betting/rest/v1.0";

const HORSE_RACING: &str = "7";
const MAX_RESULTS: u32 = 1000;

/// Markets that started this recently are still listed.
const LISTING_GRACE_SECS: i64 = 120;

// ---------------------------------------------------------------------------
// Betfair API types
// ---------------------------------------------------------------------------

/// Login response from the SSO endpoint.
#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "loginStatus")]
    login_status: String,
}

/// Market catalogue entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketCatalogue {
    market_id: String,
    market_name: String,
    #[serde(default)]
    event: Option<EventInfo>,
    #[serde(default)]
    market_start_time: Option<String>,
    #[serde(default)]
    runners: Vec<RunnerCatalogue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    venue: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerCatalogue {
    selection_id: u64,
    runner_name: String,
}

/// Market book (live prices and status).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketBook {
    market_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    runners: Vec<RunnerBook>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerBook {
    selection_id: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    ex: Option<ExchangePrices>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangePrices {
    #[serde(default)]
    available_to_back: Vec<PriceSize>,
}

#[derive(Debug, Deserialize)]
struct PriceSize {
    price: f64,
}

/// Place order request types.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrdersRequest {
    market_id: String,
    instructions: Vec<PlaceInstruction>,
    customer_ref: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlaceInstruction {
    order_type: &'static str,
    selection_id: u64,
    side: &'static str,
    limit_order: LimitOrder,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitOrder {
    size: f64,
    price: f64,
    persistence_type: &'static str,
}

/// Place orders response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrdersResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    instruction_reports: Vec<InstructionReport>,
    #[serde(default)]
    error_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionReport {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    bet_id: Option<String>,
    #[serde(default)]
    placed_date: Option<String>,
    #[serde(default)]
    average_price_matched: Option<f64>,
    #[serde(default)]
    size_matched: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Betfair Exchange client.
pub struct BetfairClient {
    http: Client,
    app_key: String,
    username: String,
    password: SecretString,
    session_token: RwLock<Option<String>>,
    countries: Vec<String>,
    dry_run: bool,
    /// Runner names per market, filled from the catalogue.
    runner_names: RwLock<HashMap<String, HashMap<u64, String>>>,
}

impl BetfairClient {
    /// Build a client from `[betfair]`, resolving credentials from the
    /// environment variables it names.
    pub fn from_config(config: &BetfairConfig) -> Result<Self> {
        let app_key = AppConfig::resolve_env(&config.app_key_env)?;
        let username = AppConfig::resolve_env(&config.username_env)?;
        let password = SecretString::new(AppConfig::resolve_env(&config.password_env)?);
        Self::with_credentials(app_key, username, password, config)
    }

    /// Create a client with explicit credentials.
    pub fn with_credentials(
        app_key: String,
        username: String,
        password: SecretString,
        config: &BetfairConfig,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("chase/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for Betfair")?;

        Ok(Self {
            http,
            app_key,
            username,
            password,
            session_token: RwLock::new(None),
            countries: config.countries.clone(),
            dry_run: config.dry_run,
            runner_names: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // -- Authentication ----------------------------------------------------

    fn set_token(&self, token: Option<String>) {
        let mut guard = self.session_token.write().unwrap_or_else(|e| e.into_inner());
        *guard = token;
    }

    fn token(&self) -> Option<String> {
        self.session_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Authenticate with Betfair SSO and store the session token.
    async fn login(&self) -> Result<String> {
        info!(username = %self.username, "Authenticating with Betfair");

        let resp = self
            .http
            .post(AUTH_URL)
            .header("X-Application", &self.app_key)
            .header("Accept", "application/json")
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret().as_str()),
            ])
            .send()
            .await
            .context("Betfair login request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Betfair login failed {status}: {body}");
        }

        let login: LoginResponse = resp
            .json()
            .await
            .context("Failed to parse Betfair login response")?;

        if login.login_status != "SUCCESS" {
            anyhow::bail!("Betfair login rejected: {}", login.login_status);
        }

        let token = login
            .session_token
            .context("Betfair login succeeded but no session token returned")?;
        self.set_token(Some(token.clone()));

        info!("Betfair authentication successful");
        Ok(token)
    }

    /// Get a valid session token, logging in if necessary.
    async fn ensure_session(&self) -> Result<String> {
        match self.token() {
            Some(token) => Ok(token),
            None => self.login().await,
        }
    }

    // -- API helpers -------------------------------------------------------

    async fn post_betting(
        &self,
        url: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.http
            .post(url)
            .header("X-Application", &self.app_key)
            .header("X-Authentication", token)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
    }

    /// Make an authenticated POST to the Betfair Betting API.
    ///
    /// A 401 clears the session and retries once after re-login.
    async fn betting_api<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let token = self.ensure_session().await?;
        let url = format!("{BETTING_URL}/{endpoint}/");

        debug!(url = %url, "Betfair API request");

        let mut resp = self
            .post_betting(&url, &token, body)
            .await
            .with_context(|| format!("Betfair {endpoint} request failed"))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("Betfair session expired, re-authenticating");
            self.set_token(None);
            let token = self.login().await?;
            resp = self
                .post_betting(&url, &token, body)
                .await
                .with_context(|| format!("Betfair {endpoint} retry failed"))?;
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Betfair {endpoint} error {status}: {body_text}");
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse Betfair {endpoint} response"))
    }

    // -- Market fetching ---------------------------------------------------

    async fn fetch_catalogues(&self, filter: serde_json::Value) -> Result<Vec<MarketCatalogue>> {
        let body = serde_json::json!({
            "filter": filter,
            "marketProjection": ["EVENT", "MARKET_START_TIME", "RUNNER_DESCRIPTION"],
            "maxResults": MAX_RESULTS,
            "sort": "FIRST_TO_START",
            "locale": "en"
        });
        let catalogues: Vec<MarketCatalogue> = self.betting_api("listMarketCatalogue", &body).await?;
        self.remember_runners(&catalogues);
        Ok(catalogues)
    }

    async fn fetch_book(&self, market_id: &str) -> Result<MarketBook> {
        let body = serde_json::json!({
            "marketIds": [market_id],
            "priceProjection": {
                "priceData": ["EX_BEST_OFFERS"],
                "virtualise": false
            }
        });
        let books: Vec<MarketBook> = self.betting_api("listMarketBook", &body).await?;
        books
            .into_iter()
            .find(|b| b.market_id == market_id)
            .with_context(|| format!("No market book returned for {market_id}"))
    }

    fn remember_runners(&self, catalogues: &[MarketCatalogue]) {
        let mut names = self.runner_names.write().unwrap_or_else(|e| e.into_inner());
        for c in catalogues.iter().filter(|c| !c.runners.is_empty()) {
            names.insert(
                c.market_id.clone(),
                c.runners
                    .iter()
                    .map(|r| (r.selection_id, r.runner_name.clone()))
                    .collect(),
            );
        }
    }

    fn cached_runner_name(&self, market_id: &str, selection_id: u64) -> Option<String> {
        self.runner_names
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(market_id)
            .and_then(|m| m.get(&selection_id))
            .cloned()
    }

    async fn runner_name(&self, market_id: &str, selection_id: u64) -> Result<String> {
        if let Some(name) = self.cached_runner_name(market_id, selection_id) {
            return Ok(name);
        }
        self.fetch_catalogues(serde_json::json!({ "marketIds": [market_id] }))
            .await?;
        Ok(self
            .cached_runner_name(market_id, selection_id)
            .unwrap_or_else(|| format!("selection {selection_id}")))
    }

    // -- Conversion helpers ------------------------------------------------

    /// Listing filter for today's GB/IE horse-racing WIN markets.
    fn todays_filter(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "eventTypeIds": [HORSE_RACING],
            "marketTypeCodes": ["WIN"],
            "marketCountries": self.countries,
            "marketStartTime": {
                "from": api_time(from),
                "to": api_time(to)
            }
        })
    }

    /// Convert a catalogue entry into a race. Entries without a parseable
    /// start time are dropped.
    fn to_race_event(catalogue: &MarketCatalogue) -> Option<RaceEvent> {
        let start_time = catalogue
            .market_start_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))?;

        let event = catalogue.event.as_ref();
        let track = event
            .and_then(|e| e.venue.as_deref())
            .or_else(|| event.and_then(|e| e.name.as_deref()))
            .unwrap_or_default()
            .trim()
            .to_string();

        Some(RaceEvent {
            id: catalogue.market_id.clone(),
            name: catalogue.market_name.clone(),
            track,
            start_time,
        })
    }

    /// Runner with the lowest best back price, skipping non-active runners.
    fn favourite_price(book: &MarketBook) -> Option<(u64, f64)> {
        let mut best: Option<(u64, f64)> = None;

        for runner in &book.runners {
            if runner.status.as_deref() != Some("ACTIVE") && runner.status.is_some() {
                continue;
            }
            let Some(back) = runner.ex.as_ref().and_then(|ex| ex.available_to_back.first()) else {
                continue;
            };
            if !back.price.is_finite() || back.price <= 0.0 {
                continue;
            }
            if best.map_or(true, |(_, p)| back.price < p) {
                best = Some((runner.selection_id, back.price));
            }
        }

        best
    }

    fn winner_of(book: &MarketBook) -> Option<u64> {
        book.runners
            .iter()
            .find(|r| r.status.as_deref() == Some("WINNER"))
            .map(|r| r.selection_id)
    }

    fn status_of(book: &MarketBook) -> MarketStatus {
        let state = MarketState::from_exchange(book.status.as_deref().unwrap_or_default());
        let winner = match state {
            MarketState::Closed => Self::winner_of(book),
            _ => None,
        };
        MarketStatus { state, winner }
    }

    fn place_orders_request(request: &WagerRequest) -> PlaceOrdersRequest {
        PlaceOrdersRequest {
            market_id: request.event.id.clone(),
            instructions: vec![PlaceInstruction {
                order_type: "LIMIT",
                selection_id: request.selection.id,
                side: "BACK",
                limit_order: LimitOrder {
                    size: request.stake.to_f64().unwrap_or(0.0),
                    price: request.odds.to_f64().unwrap_or(0.0),
                    persistence_type: "LAPSE",
                },
            }],
            customer_ref: request.customer_ref.clone(),
        }
    }

    fn receipt_from_response(
        request: &WagerRequest,
        resp: &PlaceOrdersResponse,
    ) -> Result<WagerReceipt> {
        if let Some(ref error_code) = resp.error_code {
            anyhow::bail!("Betfair placeOrders error: {error_code}");
        }

        if resp.status.as_deref() != Some("SUCCESS") {
            let instruction_error = resp
                .instruction_reports
                .first()
                .and_then(|r| r.error_code.as_deref())
                .unwrap_or("UNKNOWN");
            anyhow::bail!(
                "Betfair order {}: {instruction_error}",
                resp.status.as_deref().unwrap_or("without status")
            );
        }

        let report = resp
            .instruction_reports
            .first()
            .context("No instruction report in placeOrders response")?;
        let bet_id = report
            .bet_id
            .clone()
            .context("placeOrders succeeded without a bet id")?;

        let placed_at = report
            .placed_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        if let Some(matched) = report.size_matched {
            if d(matched) < request.stake {
                warn!(
                    bet_id = %bet_id,
                    matched,
                    stake = %request.stake,
                    "Order only partially matched"
                );
            }
        }

        Ok(WagerReceipt {
            bet_id,
            market_id: request.event.id.clone(),
            selection_id: request.selection.id,
            stake: request.stake,
            odds: report
                .average_price_matched
                .filter(|p| *p > 0.0)
                .map(d)
                .unwrap_or(request.odds),
            placed_at,
        })
    }
}

/// Listing window: from just before `now` to the next local midnight.
pub fn todays_window(now: DateTime<Utc>, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = now - ChronoDuration::seconds(LISTING_GRACE_SECS);
    let local_date = now.with_timezone(&tz).date_naive();
    let to = local_date
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now + ChronoDuration::days(1));
    (from, to)
}

fn api_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ---------------------------------------------------------------------------
// RacingExchange trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl RacingExchange for BetfairClient {
    async fn list_todays_events(&self, tz: Tz) -> Result<Vec<RaceEvent>> {
        let (from, to) = todays_window(Utc::now(), tz);
        let catalogues = self.fetch_catalogues(self.todays_filter(from, to)).await?;

        let mut events: Vec<RaceEvent> = catalogues.iter().filter_map(Self::to_race_event).collect();
        events.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        info!(count = events.len(), from = %from, to = %to, "Betfair races listed");
        Ok(events)
    }

    async fn resolve_favourite(&self, event: &RaceEvent) -> Result<Option<Favourite>> {
        let book = self.fetch_book(&event.id).await?;
        let Some((selection_id, price)) = Self::favourite_price(&book) else {
            warn!(market = %event.id, "No back prices available");
            return Ok(None);
        };

        let name = self.runner_name(&event.id, selection_id).await?;
        let favourite = Favourite {
            selection: Selection { id: selection_id, name },
            odds: d(price),
        };
        debug!(
            market = %event.id,
            selection = %favourite.selection.name,
            odds = %favourite.odds,
            "Favourite resolved"
        );
        Ok(Some(favourite))
    }

    async fn place_wager(&self, request: &WagerRequest) -> Result<WagerReceipt> {
        if self.dry_run {
            let receipt = WagerReceipt::dry_run(request);
            info!(receipt = %receipt, "Dry run, order not sent");
            return Ok(receipt);
        }

        let body = serde_json::to_value(Self::place_orders_request(request))
            .context("Failed to encode placeOrders request")?;
        let resp: PlaceOrdersResponse = self.betting_api("placeOrders", &body).await?;
        let receipt = Self::receipt_from_response(request, &resp)?;

        info!(receipt = %receipt, customer_ref = %request.customer_ref, "Betfair order placed");
        Ok(receipt)
    }

    async fn poll_status(&self, event: &RaceEvent) -> Result<MarketStatus> {
        let book = self.fetch_book(&event.id).await?;
        Ok(Self::status_of(&book))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
