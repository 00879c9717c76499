use crate::error::AppError;
use crate::market::types::{MarketSelection, MarketTimeframe};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEFRAME: MarketTimeframe = MarketTimeframe::D1;
pub const DEFAULT_INITIAL_LIMIT: u16 = 300;
pub const DEFAULT_REFRESH_LIMIT: u16 = 120;
pub const DEFAULT_BACKFILL_LIMIT: u16 = 300;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_ORDERBOOK_DEPTH: u16 = 20;
pub const DEFAULT_TAPE_LIMIT: u16 = 50;
pub const DEFAULT_USER_TRADES_LIMIT: u16 = 100;
pub const DEFAULT_REALTIME: bool = true;
pub const DEFAULT_RETRY_BACKFILL_ON_FAILURE: bool = false;
pub const MIN_CANDLE_LIMIT: u16 = 10;
pub const MAX_CANDLE_LIMIT: u16 = 1_000;
pub const MIN_REFRESH_INTERVAL_MS: u64 = 1_000;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 60_000;
pub const MIN_LIST_LIMIT: u16 = 1;
pub const MAX_LIST_LIMIT: u16 = 500;

const MARKET_ENV: &str = "TERMINAL_MARKET";
const TIMEFRAME_ENV: &str = "TERMINAL_TIMEFRAME";
const REFRESH_INTERVAL_ENV: &str = "TERMINAL_REFRESH_INTERVAL_MS";
const REALTIME_ENV: &str = "TERMINAL_REALTIME";
const RETRY_BACKFILL_ENV: &str = "TERMINAL_RETRY_BACKFILL";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMarketStreamArgs {
    pub market: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
    pub initial_limit: Option<u16>,
    pub refresh_limit: Option<u16>,
    pub backfill_limit: Option<u16>,
    pub refresh_interval_ms: Option<u64>,
    pub orderbook_depth: Option<u16>,
    pub tape_limit: Option<u16>,
    pub realtime: Option<bool>,
    pub retry_backfill_on_failure: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    pub selection: MarketSelection,
    pub initial_limit: u16,
    pub refresh_limit: u16,
    pub backfill_limit: u16,
    pub refresh_interval_ms: u64,
    pub orderbook_depth: u16,
    pub tape_limit: u16,
    pub realtime: bool,
    pub retry_backfill_on_failure: bool,
}

pub fn normalize_market(market: &str) -> Result<String, AppError> {
    let market = market.trim().to_string();
    let allowed = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '/' | '-' | '_' | '.');
    if market.is_empty() || !market.chars().all(allowed) {
        return Err(AppError::InvalidArgument(
            "market must be non-empty ASCII alphanumerics or '/', '-', '_', '.'".to_string(),
        ));
    }
    Ok(market)
}

fn limit_in_range(
    value: Option<u16>,
    default: u16,
    min: u16,
    max: u16,
    name: &str,
) -> Result<u16, AppError> {
    let value = value.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(AppError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(value)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::InvalidArgument(format!(
            "{name} must be a boolean, got '{raw}'"
        ))),
    }
}

impl StartMarketStreamArgs {
    pub fn from_env() -> Result<Self, AppError> {
        let timeframe = env_value(TIMEFRAME_ENV)
            .map(|raw| MarketTimeframe::parse_str(&raw))
            .transpose()?;
        let refresh_interval_ms = env_value(REFRESH_INTERVAL_ENV)
            .map(|raw| {
                raw.parse::<u64>().map_err(|_| {
                    AppError::InvalidArgument(format!(
                        "{REFRESH_INTERVAL_ENV} must be an integer, got '{raw}'"
                    ))
                })
            })
            .transpose()?;
        let realtime = env_value(REALTIME_ENV)
            .map(|raw| parse_env_bool(REALTIME_ENV, &raw))
            .transpose()?;
        let retry_backfill_on_failure = env_value(RETRY_BACKFILL_ENV)
            .map(|raw| parse_env_bool(RETRY_BACKFILL_ENV, &raw))
            .transpose()?;

        Ok(Self {
            market: env_value(MARKET_ENV),
            timeframe,
            refresh_interval_ms,
            realtime,
            retry_backfill_on_failure,
            ..Self::default()
        })
    }

    pub fn normalize(self) -> Result<ReconcilerConfig, AppError> {
        let market = normalize_market(self.market.as_deref().unwrap_or_default())?;
        let timeframe = self.timeframe.unwrap_or(DEFAULT_TIMEFRAME);

        let initial_limit = limit_in_range(
            self.initial_limit,
            DEFAULT_INITIAL_LIMIT,
            MIN_CANDLE_LIMIT,
            MAX_CANDLE_LIMIT,
            "initialLimit",
        )?;
        let refresh_limit = limit_in_range(
            self.refresh_limit,
            DEFAULT_REFRESH_LIMIT,
            MIN_CANDLE_LIMIT,
            MAX_CANDLE_LIMIT,
            "refreshLimit",
        )?;
        let backfill_limit = limit_in_range(
            self.backfill_limit,
            DEFAULT_BACKFILL_LIMIT,
            MIN_CANDLE_LIMIT,
            MAX_CANDLE_LIMIT,
            "backfillLimit",
        )?;

        let refresh_interval_ms = self
            .refresh_interval_ms
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_MS);
        if !(MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&refresh_interval_ms) {
            return Err(AppError::InvalidArgument(format!(
                "refreshIntervalMs must be between {MIN_REFRESH_INTERVAL_MS} and {MAX_REFRESH_INTERVAL_MS}"
            )));
        }

        let orderbook_depth = limit_in_range(
            self.orderbook_depth,
            DEFAULT_ORDERBOOK_DEPTH,
            MIN_LIST_LIMIT,
            MAX_LIST_LIMIT,
            "orderbookDepth",
        )?;
        let tape_limit = limit_in_range(
            self.tape_limit,
            DEFAULT_TAPE_LIMIT,
            MIN_LIST_LIMIT,
            MAX_LIST_LIMIT,
            "tapeLimit",
        )?;

        Ok(ReconcilerConfig {
            selection: MarketSelection::new(market, timeframe),
            initial_limit,
            refresh_limit,
            backfill_limit,
            refresh_interval_ms,
            orderbook_depth,
            tape_limit,
            realtime: self.realtime.unwrap_or(DEFAULT_REALTIME),
            retry_backfill_on_failure: self
                .retry_backfill_on_failure
                .unwrap_or(DEFAULT_RETRY_BACKFILL_ON_FAILURE),
        })
    }
}
