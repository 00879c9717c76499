use crate::market::types::{Candle, TradeEvent};
use std::collections::BTreeMap;

/// Floor-aligns `timestamp_ms` to the start of its bucket.
pub fn candle_bucket_open_time(timestamp_ms: i64, bucket_ms: i64) -> i64 {
    if bucket_ms <= 0 {
        return timestamp_ms;
    }
    timestamp_ms - timestamp_ms.rem_euclid(bucket_ms)
}

impl Candle {
    pub fn from_trade(bucket_start: i64, trade: &TradeEvent) -> Self {
        Self {
            bucket_start,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            base_volume: trade.base_amount,
            quote_volume: trade.quote_amount,
        }
    }

    pub fn apply_trade(&mut self, trade: &TradeEvent) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.base_volume += trade.base_amount;
        self.quote_volume += trade.quote_amount;
    }
}

/// Folds one trade into the candle of its bucket. `close` is last-writer-wins,
/// so callers must feed trades in ascending `occurred_at` order.
pub fn bucket_trade(existing: Option<&Candle>, trade: &TradeEvent, bucket_ms: i64) -> Candle {
    let bucket_start = candle_bucket_open_time(trade.occurred_at, bucket_ms);
    match existing {
        Some(current) if current.bucket_start == bucket_start => {
            let mut next = current.clone();
            next.apply_trade(trade);
            next
        }
        _ => Candle::from_trade(bucket_start, trade),
    }
}

/// Candles of one (market, interval) keyed by `bucket_start`, at most one per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleSeries {
    buckets: BTreeMap<i64, Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries win on duplicate keys.
    pub fn from_candles(candles: impl IntoIterator<Item = Candle>) -> Self {
        let mut series = Self::new();
        for candle in candles {
            series.buckets.insert(candle.bucket_start, candle);
        }
        series
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn get(&self, bucket_start: i64) -> Option<&Candle> {
        self.buckets.get(&bucket_start)
    }

    pub fn oldest_bucket_start(&self) -> Option<i64> {
        self.buckets.keys().next().copied()
    }

    pub fn newest_bucket_start(&self) -> Option<i64> {
        self.buckets.keys().next_back().copied()
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.buckets.values().next_back()
    }

    /// Ascending by `bucket_start`.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Candle> + ExactSizeIterator + '_ {
        self.buckets.values()
    }

    pub fn to_vec(&self) -> Vec<Candle> {
        self.buckets.values().cloned().collect()
    }

    /// Whole-candle replacement: every key of `incoming` overwrites `self`.
    pub fn merge_from(&mut self, incoming: &CandleSeries) {
        for (bucket_start, candle) in &incoming.buckets {
            self.buckets.insert(*bucket_start, candle.clone());
        }
    }

    /// Inserts only keys `self` does not hold yet.
    pub fn merge_missing_from(&mut self, older: &CandleSeries) {
        for (bucket_start, candle) in &older.buckets {
            self.buckets
                .entry(*bucket_start)
                .or_insert_with(|| candle.clone());
        }
    }

    /// Applies trades, sorted ascending by time first, and returns the
    /// bucket keys that changed.
    pub fn apply_trades<'a>(
        &mut self,
        trades: impl IntoIterator<Item = &'a TradeEvent>,
        bucket_ms: i64,
    ) -> Vec<i64> {
        let mut ordered: Vec<&TradeEvent> = trades.into_iter().collect();
        ordered.sort_by_key(|trade| trade.occurred_at);

        let mut touched = Vec::new();
        for trade in ordered {
            let bucket_start = candle_bucket_open_time(trade.occurred_at, bucket_ms);
            let next = bucket_trade(self.buckets.get(&bucket_start), trade, bucket_ms);
            self.buckets.insert(bucket_start, next);
            if !touched.contains(&bucket_start) {
                touched.push(bucket_start);
            }
        }
        touched.sort_unstable();
        touched
    }
}

/// Union of both series; on a shared key the `incoming` candle wins entirely.
pub fn merge(base: &CandleSeries, incoming: &CandleSeries) -> CandleSeries {
    if incoming.is_empty() {
        return base.clone();
    }
    let mut merged = base.clone();
    merged.merge_from(incoming);
    merged
}
