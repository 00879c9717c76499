use crate::error::AppError;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarketConnectionState {
    Connecting,
    Live,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MarketTimeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl MarketTimeframe {
    pub const ALL: [MarketTimeframe; 5] = [Self::M1, Self::M5, Self::H1, Self::D1, Self::W1];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::H1 => "1h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::H1 => 3_600_000,
            Self::D1 => 86_400_000,
            Self::W1 => 604_800_000,
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, AppError> {
        let trimmed = value.trim();
        Self::ALL
            .into_iter()
            .find(|timeframe| timeframe.as_str() == trimmed)
            .ok_or_else(|| AppError::InvalidArgument(format!("unsupported timeframe '{trimmed}'")))
    }
}

/// The (market, interval) pair a candle series belongs to. Fetch results and
/// realtime events carry the selection that issued them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct MarketSelection {
    pub market: String,
    pub timeframe: MarketTimeframe,
}

impl MarketSelection {
    pub fn new(market: impl Into<String>, timeframe: MarketTimeframe) -> Self {
        Self {
            market: market.into(),
            timeframe,
        }
    }

    pub fn bucket_ms(&self) -> i64 {
        self.timeframe.duration_ms()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    /// Anything other than an explicit "buy" renders as the sell side.
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some(raw) if raw.trim().eq_ignore_ascii_case("buy") => Self::Buy,
            _ => Self::Sell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub id: Option<String>,
    pub occurred_at: i64,
    pub price: f64,
    pub base_amount: f64,
    pub quote_amount: f64,
    pub taker_side: Side,
}

impl TradeEvent {
    pub fn new(
        occurred_at: i64,
        price: f64,
        base_amount: f64,
        quote_amount: Option<f64>,
        taker_side: Side,
    ) -> Self {
        Self {
            id: None,
            occurred_at,
            price,
            base_amount,
            quote_amount: default_quote_amount(price, base_amount, quote_amount),
            taker_side,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

fn default_quote_amount(price: f64, base_amount: f64, quote_amount: Option<f64>) -> f64 {
    match quote_amount {
        Some(quote) if quote != 0.0 => quote,
        _ => price * base_amount,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookLevel {
    pub price: f64,
    pub amount: f64,
}

/// Full replacement of the book, never a delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserOrder {
    pub id: String,
    pub market: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub remaining: f64,
    pub status: String,
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserTrade {
    pub trade: TradeEvent,
    pub fee: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamStatusSnapshot {
    pub state: MarketConnectionState,
    pub market: String,
    pub timeframe: MarketTimeframe,
    pub candle_count: usize,
    pub oldest_bucket_start: Option<i64>,
    pub newest_bucket_start: Option<i64>,
    pub last_trade_at: Option<i64>,
    pub reason: Option<String>,
}

impl MarketStreamStatusSnapshot {
    pub fn stopped(market: String, timeframe: MarketTimeframe, reason: Option<String>) -> Self {
        Self {
            state: MarketConnectionState::Stopped,
            market,
            timeframe,
            candle_count: 0,
            oldest_bucket_start: None,
            newest_bucket_start: None,
            last_trade_at: None,
            reason,
        }
    }
}

// ---- wire shapes ---------------------------------------------------------

/// Backend numbers arrive either as JSON numbers or numeric strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberWire {
    Number(f64),
    Text(String),
}

impl NumberWire {
    pub fn parse(&self) -> Result<f64, AppError> {
        let value = match self {
            Self::Number(value) => *value,
            Self::Text(text) => text.trim().parse::<f64>()?,
        };
        if !value.is_finite() {
            return Err(AppError::MalformedResponse(
                "numeric field must be finite".to_string(),
            ));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimestampWire {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl TimestampWire {
    pub fn parse(&self) -> Result<i64, AppError> {
        match self {
            Self::Millis(value) => Ok(*value),
            Self::Fractional(value) if value.is_finite() => Ok(value.floor() as i64),
            Self::Fractional(_) => Err(AppError::MalformedResponse(
                "timestamp must be finite".to_string(),
            )),
            Self::Text(text) => {
                let trimmed = text.trim();
                if let Ok(millis) = trimmed.parse::<i64>() {
                    return Ok(millis);
                }
                let parsed = chrono::DateTime::parse_from_rfc3339(trimmed)?;
                Ok(parsed.timestamp_millis())
            }
        }
    }
}

fn required_number(value: Option<&NumberWire>, field: &str) -> Result<f64, AppError> {
    value
        .ok_or_else(|| AppError::MalformedResponse(format!("missing field '{field}'")))?
        .parse()
}

fn optional_number(value: Option<&NumberWire>) -> Option<f64> {
    value.and_then(|number| number.parse().ok())
}

/// Validates a batch at the ingestion boundary, dropping entries that fail.
pub fn ingest_all<W, T>(items: Vec<W>, what: &str) -> Vec<T>
where
    T: TryFrom<W, Error = AppError>,
{
    let total = items.len();
    let mut accepted = Vec::with_capacity(total);
    let mut last_error = None;
    for item in items {
        match T::try_from(item) {
            Ok(value) => accepted.push(value),
            Err(error) => last_error = Some(error),
        }
    }

    if let Some(error) = last_error {
        warn!(
            dropped = total - accepted.len(),
            total,
            "dropped malformed {what}: {error}"
        );
    }
    accepted
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandleWire {
    pub ts: Option<TimestampWire>,
    pub o: Option<NumberWire>,
    pub h: Option<NumberWire>,
    pub l: Option<NumberWire>,
    pub c: Option<NumberWire>,
    pub v: Option<NumberWire>,
    pub q: Option<NumberWire>,
}

impl TryFrom<CandleWire> for Candle {
    type Error = AppError;

    fn try_from(value: CandleWire) -> Result<Self, Self::Error> {
        let bucket_start = value
            .ts
            .as_ref()
            .ok_or_else(|| AppError::MalformedResponse("missing field 'ts'".to_string()))?
            .parse()?;
        let open = required_number(value.o.as_ref(), "o")?;
        let high = required_number(value.h.as_ref(), "h")?;
        let low = required_number(value.l.as_ref(), "l")?;
        let close = required_number(value.c.as_ref(), "c")?;

        if low > high || !(low..=high).contains(&open) || !(low..=high).contains(&close) {
            return Err(AppError::MalformedResponse(format!(
                "candle {bucket_start} violates low <= open, close <= high"
            )));
        }

        Ok(Self {
            bucket_start,
            open,
            high,
            low,
            close,
            base_volume: optional_number(value.v.as_ref()).unwrap_or(0.0).max(0.0),
            quote_volume: optional_number(value.q.as_ref()).unwrap_or(0.0).max(0.0),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandlesResponseWire {
    #[serde(default)]
    pub candles: Option<Vec<CandleWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeWire {
    #[serde(rename = "_id", alias = "id")]
    pub id: Option<String>,
    pub price: Option<NumberWire>,
    pub amount: Option<NumberWire>,
    pub quote: Option<NumberWire>,
    #[serde(rename = "takerSide")]
    pub taker_side: Option<String>,
    #[serde(rename = "createdAt", alias = "ts")]
    pub created_at: Option<TimestampWire>,
}

impl TryFrom<TradeWire> for TradeEvent {
    type Error = AppError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        let occurred_at = value
            .created_at
            .as_ref()
            .ok_or_else(|| AppError::MalformedResponse("missing field 'createdAt'".to_string()))?
            .parse()?;
        let price = required_number(value.price.as_ref(), "price")?;
        let base_amount = optional_number(value.amount.as_ref())
            .unwrap_or(0.0)
            .max(0.0);
        let quote_amount = optional_number(value.quote.as_ref());

        Ok(Self {
            id: value.id,
            occurred_at,
            price,
            base_amount,
            quote_amount: default_quote_amount(price, base_amount, quote_amount),
            taker_side: Side::from_wire(value.taker_side.as_deref()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradesResponseWire {
    #[serde(default)]
    pub trades: Option<Vec<TradeWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookLevelWire {
    pub price: Option<NumberWire>,
    pub amount: Option<NumberWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderBookWire {
    #[serde(default)]
    pub bids: Option<Vec<OrderBookLevelWire>>,
    #[serde(default)]
    pub asks: Option<Vec<OrderBookLevelWire>>,
}

fn ingest_levels(levels: Option<Vec<OrderBookLevelWire>>) -> Vec<OrderBookLevel> {
    levels
        .unwrap_or_default()
        .into_iter()
        .filter_map(|level| {
            let price = optional_number(level.price.as_ref())?;
            let amount = optional_number(level.amount.as_ref()).unwrap_or(0.0);
            Some(OrderBookLevel { price, amount })
        })
        .collect()
}

impl From<OrderBookWire> for OrderBookSnapshot {
    fn from(value: OrderBookWire) -> Self {
        Self {
            bids: ingest_levels(value.bids),
            asks: ingest_levels(value.asks),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketsResponseWire {
    #[serde(default)]
    pub markets: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserOrderWire {
    #[serde(rename = "_id", alias = "id")]
    pub id: Option<String>,
    pub market: Option<String>,
    pub side: Option<String>,
    pub price: Option<NumberWire>,
    pub amount: Option<NumberWire>,
    pub remaining: Option<NumberWire>,
    pub status: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<TimestampWire>,
}

impl TryFrom<UserOrderWire> for UserOrder {
    type Error = AppError;

    fn try_from(value: UserOrderWire) -> Result<Self, Self::Error> {
        let id = value
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| AppError::MalformedResponse("order without id".to_string()))?;
        let price = required_number(value.price.as_ref(), "price")?;
        let amount = optional_number(value.amount.as_ref()).unwrap_or(0.0);

        Ok(Self {
            id,
            market: value.market.unwrap_or_default(),
            side: Side::from_wire(value.side.as_deref()),
            price,
            amount,
            remaining: optional_number(value.remaining.as_ref()).unwrap_or(amount),
            status: value.status.unwrap_or_else(|| "open".to_string()),
            created_at: value.created_at.and_then(|ts| ts.parse().ok()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserOrdersResponseWire {
    #[serde(default)]
    pub orders: Option<Vec<UserOrderWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTradeWire {
    #[serde(rename = "_id", alias = "id")]
    pub id: Option<String>,
    pub price: Option<NumberWire>,
    pub amount: Option<NumberWire>,
    pub quote: Option<NumberWire>,
    #[serde(rename = "takerSide")]
    pub taker_side: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<TimestampWire>,
    pub fee: Option<NumberWire>,
}

impl TryFrom<UserTradeWire> for UserTrade {
    type Error = AppError;

    fn try_from(value: UserTradeWire) -> Result<Self, Self::Error> {
        let fee = optional_number(value.fee.as_ref()).filter(|fee| *fee > 0.0);
        let trade = TradeEvent::try_from(TradeWire {
            id: value.id,
            price: value.price,
            amount: value.amount,
            quote: value.quote,
            taker_side: value.taker_side,
            created_at: value.created_at,
        })?;
        Ok(Self { trade, fee })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTradesResponseWire {
    #[serde(default)]
    pub trades: Option<Vec<UserTradeWire>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorWire {
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<T: serde::de::DeserializeOwned>(json: &str) -> T {
        let mut payload = json.as_bytes().to_vec();
        simd_json::serde::from_slice(payload.as_mut_slice()).expect("fixture should decode")
    }

    #[test]
    fn parses_candle_with_numeric_strings() {
        let wire: CandleWire =
            decode(r#"{"ts":1700000000000,"o":"10","h":"12.5","l":9,"c":"11","v":3,"q":"33"}"#);
        let candle = Candle::try_from(wire).expect("candle should validate");

        assert_eq!(candle.bucket_start, 1_700_000_000_000);
        assert_eq!(candle.high, 12.5);
        assert_eq!(candle.low, 9.0);
        assert_eq!(candle.quote_volume, 33.0);
    }

    #[test]
    fn defaults_missing_candle_volumes_to_zero() {
        let wire: CandleWire = decode(r#"{"ts":60000,"o":1,"h":2,"l":1,"c":2}"#);
        let candle = Candle::try_from(wire).expect("candle should validate");

        assert_eq!(candle.base_volume, 0.0);
        assert_eq!(candle.quote_volume, 0.0);
    }

    #[test]
    fn rejects_candle_with_inverted_range() {
        let wire: CandleWire = decode(r#"{"ts":60000,"o":5,"h":4,"l":6,"c":5}"#);
        assert!(Candle::try_from(wire).is_err());
    }

    #[test]
    fn rejects_candle_with_open_or_close_outside_range() {
        let open_above: CandleWire = decode(r#"{"ts":60000,"o":7,"h":6,"l":4,"c":5}"#);
        let close_below: CandleWire = decode(r#"{"ts":60000,"o":5,"h":6,"l":4,"c":3}"#);
        assert!(Candle::try_from(open_above).unwrap_err().is_malformed());
        assert!(Candle::try_from(close_below).unwrap_err().is_malformed());

        let on_edges: CandleWire = decode(r#"{"ts":60000,"o":4,"h":6,"l":4,"c":6}"#);
        assert!(Candle::try_from(on_edges).is_ok());
    }

    #[test]
    fn rejects_candle_without_timestamp() {
        let wire: CandleWire = decode(r#"{"o":1,"h":2,"l":1,"c":2}"#);
        assert!(Candle::try_from(wire).is_err());
    }

    #[test]
    fn ingest_all_drops_only_malformed_entries() {
        let response: CandlesResponseWire = decode(
            r#"{"candles":[{"ts":0,"o":1,"h":1,"l":1,"c":1},{"ts":60000,"o":"x","h":1,"l":1,"c":1}]}"#,
        );
        let candles: Vec<Candle> =
            ingest_all(response.candles.unwrap_or_default(), "candles");

        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].bucket_start, 0);
    }

    #[test]
    fn parses_trade_with_rfc3339_timestamp_and_default_quote() {
        let wire: TradeWire = decode(
            r#"{"_id":"t-1","price":20,"amount":"0.5","takerSide":"buy","createdAt":"2023-11-14T22:13:20.000Z"}"#,
        );
        let trade = TradeEvent::try_from(wire).expect("trade should validate");

        assert_eq!(trade.id.as_deref(), Some("t-1"));
        assert_eq!(trade.occurred_at, 1_700_000_000_000);
        assert_eq!(trade.quote_amount, 10.0);
        assert_eq!(trade.taker_side, Side::Buy);
    }

    #[test]
    fn zero_quote_falls_back_to_notional() {
        let trade = TradeEvent::new(0, 4.0, 2.0, Some(0.0), Side::Sell);
        assert_eq!(trade.quote_amount, 8.0);
    }

    #[test]
    fn trade_without_price_is_rejected() {
        let wire: TradeWire = decode(r#"{"amount":1,"createdAt":1000}"#);
        assert!(TradeEvent::try_from(wire).is_err());
    }

    #[test]
    fn unknown_taker_side_maps_to_sell() {
        assert_eq!(Side::from_wire(Some("BUY")), Side::Buy);
        assert_eq!(Side::from_wire(Some("maker")), Side::Sell);
        assert_eq!(Side::from_wire(None), Side::Sell);
    }

    #[test]
    fn order_book_drops_invalid_levels_and_defaults_sides() {
        let wire: OrderBookWire =
            decode(r#"{"bids":[{"price":"101","amount":2},{"price":"bad","amount":1}]}"#);
        let snapshot = OrderBookSnapshot::from(wire);

        assert_eq!(snapshot.bids.len(), 1);
        assert_eq!(snapshot.bids[0].price, 101.0);
        assert!(snapshot.asks.is_empty());
    }

    #[test]
    fn user_order_defaults_remaining_to_amount() {
        let wire: UserOrderWire =
            decode(r#"{"_id":"o-1","market":"BTC/USDT","side":"buy","price":10,"amount":3}"#);
        let order = UserOrder::try_from(wire).expect("order should validate");

        assert_eq!(order.remaining, 3.0);
        assert_eq!(order.status, "open");
        assert_eq!(order.side, Side::Buy);
    }

    #[test]
    fn user_trade_keeps_positive_fee_only() {
        let wire: UserTradeWire =
            decode(r#"{"_id":"t","price":2,"amount":1,"createdAt":5,"fee":0}"#);
        let trade = UserTrade::try_from(wire).expect("user trade should validate");
        assert!(trade.fee.is_none());
    }

    #[test]
    fn parses_every_supported_timeframe() {
        for timeframe in MarketTimeframe::ALL {
            assert_eq!(
                MarketTimeframe::parse_str(timeframe.as_str()).expect("round trip"),
                timeframe
            );
        }
        assert!(MarketTimeframe::parse_str("4h").is_err());
    }
}
