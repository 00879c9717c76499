use crate::error::AppError;
use crate::market::backfill::BackfillTrigger;
use crate::market::book::last_trade;
use crate::market::candles::{merge, CandleSeries};
use crate::market::types::{
    Candle, MarketSelection, OrderBookSnapshot, TradeEvent, UserOrder, UserTrade,
};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

pub const RECENT_TRADE_ID_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// State changed. `touched` lists the candle buckets that were rewritten.
    Applied { touched: Vec<i64> },
    Unchanged,
    /// The update belongs to a selection that is no longer active.
    Discarded,
    /// The fetch failed; current state was kept.
    Failed,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Ids of trades already folded into candles, oldest evicted first.
#[derive(Debug, Clone)]
struct RecentTradeIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentTradeIds {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1_024)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when the id was already remembered.
    fn remember(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// Single owner of the candle series, backfill latch, order book, tape and
/// user feeds for the active selection. Every update names the selection (or
/// market) that produced it and is dropped when that no longer matches.
#[derive(Debug, Clone)]
pub struct MarketReconciler {
    selection: MarketSelection,
    series: CandleSeries,
    trigger: BackfillTrigger,
    order_book: OrderBookSnapshot,
    tape: Vec<TradeEvent>,
    user_orders: Vec<UserOrder>,
    user_trades: Vec<UserTrade>,
    recent_trade_ids: RecentTradeIds,
    retry_backfill_on_failure: bool,
}

impl MarketReconciler {
    pub fn new(selection: MarketSelection, retry_backfill_on_failure: bool) -> Self {
        Self {
            selection,
            series: CandleSeries::new(),
            trigger: BackfillTrigger::new(),
            order_book: OrderBookSnapshot::default(),
            tape: Vec::new(),
            user_orders: Vec::new(),
            user_trades: Vec::new(),
            recent_trade_ids: RecentTradeIds::with_capacity(RECENT_TRADE_ID_CAPACITY),
            retry_backfill_on_failure,
        }
    }

    pub fn selection(&self) -> &MarketSelection {
        &self.selection
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    pub fn trigger(&self) -> &BackfillTrigger {
        &self.trigger
    }

    pub fn order_book(&self) -> &OrderBookSnapshot {
        &self.order_book
    }

    pub fn tape(&self) -> &[TradeEvent] {
        &self.tape
    }

    pub fn user_orders(&self) -> &[UserOrder] {
        &self.user_orders
    }

    pub fn user_trades(&self) -> &[UserTrade] {
        &self.user_trades
    }

    pub fn last_trade_at(&self) -> Option<i64> {
        last_trade(&self.tape).map(|trade| trade.occurred_at)
    }

    pub fn candles(&self, bucket_starts: &[i64]) -> Vec<Candle> {
        bucket_starts
            .iter()
            .filter_map(|bucket_start| self.series.get(*bucket_start).cloned())
            .collect()
    }

    /// Switches the active selection. The series and backfill latch always
    /// reset; book, tape, user feeds and remembered trade ids only when the
    /// market itself changes.
    /// Returns `false` when `selection` is already active.
    pub fn select(&mut self, selection: MarketSelection) -> bool {
        if selection == self.selection {
            return false;
        }

        let market_changed = selection.market != self.selection.market;
        self.selection = selection;
        self.series = CandleSeries::new();
        self.trigger.reset();
        // Every timeframe of one market already contains the trades seen so far.
        if market_changed {
            self.recent_trade_ids.clear();
            self.order_book = OrderBookSnapshot::default();
            self.tape.clear();
            self.user_orders.clear();
            self.user_trades.clear();
        }
        true
    }

    fn is_current(&self, origin: &MarketSelection) -> bool {
        *origin == self.selection
    }

    fn is_current_market(&self, market: &str) -> bool {
        market == self.selection.market
    }

    /// Replaces the series wholesale with the latest buckets.
    pub fn apply_initial_load(
        &mut self,
        origin: &MarketSelection,
        result: Result<Vec<Candle>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current(origin) {
            debug!(market = %origin.market, timeframe = origin.timeframe.as_str(), "discarding stale initial candles");
            return ApplyOutcome::Discarded;
        }
        let candles = match result {
            Ok(candles) => candles,
            Err(error) => {
                warn!(market = %origin.market, "initial candle load failed: {error}");
                return ApplyOutcome::Failed;
            }
        };

        self.series = CandleSeries::from_candles(candles);
        self.trigger.reset();
        self.trigger.observe_oldest(self.series.oldest_bucket_start());
        ApplyOutcome::Applied {
            touched: self.series.iter().map(|candle| candle.bucket_start).collect(),
        }
    }

    /// Merges the most recent buckets; incoming candles win on shared keys.
    pub fn apply_refresh(
        &mut self,
        origin: &MarketSelection,
        result: Result<Vec<Candle>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current(origin) {
            debug!(market = %origin.market, "discarding stale refresh");
            return ApplyOutcome::Discarded;
        }
        let incoming = match result {
            Ok(candles) => CandleSeries::from_candles(candles),
            Err(error) => {
                warn!(market = %origin.market, "candle refresh failed: {error}");
                return ApplyOutcome::Failed;
            }
        };

        let touched: Vec<i64> = incoming
            .iter()
            .filter(|candle| self.series.get(candle.bucket_start) != Some(*candle))
            .map(|candle| candle.bucket_start)
            .collect();
        if touched.is_empty() {
            return ApplyOutcome::Unchanged;
        }

        self.series = merge(&self.series, &incoming);
        self.trigger.observe_oldest(self.series.oldest_bucket_start());
        ApplyOutcome::Applied { touched }
    }

    /// Merges older history ending at `boundary`. Buckets already loaded are
    /// kept as they are.
    pub fn apply_backfill(
        &mut self,
        origin: &MarketSelection,
        boundary: i64,
        result: Result<Vec<Candle>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current(origin) {
            debug!(market = %origin.market, boundary, "discarding stale backfill");
            return ApplyOutcome::Discarded;
        }
        let older = match result {
            Ok(candles) => CandleSeries::from_candles(candles),
            Err(error) => {
                warn!(market = %origin.market, boundary, "backfill failed: {error}");
                if self.retry_backfill_on_failure {
                    self.trigger.release(boundary);
                }
                return ApplyOutcome::Failed;
            }
        };

        let touched: Vec<i64> = older
            .iter()
            .map(|candle| candle.bucket_start)
            .filter(|bucket_start| self.series.get(*bucket_start).is_none())
            .collect();

        self.series.merge_missing_from(&older);
        self.trigger.observe_oldest(self.series.oldest_bucket_start());
        if touched.is_empty() {
            return ApplyOutcome::Unchanged;
        }
        ApplyOutcome::Applied { touched }
    }

    /// Buckets pushed trades into the series and replaces the tape with the
    /// pushed batch. Trades whose id was already bucketed are skipped.
    pub fn apply_live_trades(&mut self, market: &str, trades: Vec<TradeEvent>) -> ApplyOutcome {
        if !self.is_current_market(market) {
            debug!(market, "discarding trades for inactive market");
            return ApplyOutcome::Discarded;
        }

        let fresh: Vec<&TradeEvent> = trades
            .iter()
            .filter(|trade| match trade.id.as_deref() {
                Some(id) => self.recent_trade_ids.remember(id),
                None => true,
            })
            .collect();
        let touched = self
            .series
            .apply_trades(fresh, self.selection.bucket_ms());
        self.trigger.observe_oldest(self.series.oldest_bucket_start());

        self.tape = trades;
        ApplyOutcome::Applied { touched }
    }

    /// Replaces the tape from a REST snapshot. Those trades are already part
    /// of the server candles, so their ids are remembered and never bucketed.
    pub fn apply_tape(
        &mut self,
        market: &str,
        result: Result<Vec<TradeEvent>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current_market(market) {
            return ApplyOutcome::Discarded;
        }
        match result {
            Ok(trades) => {
                for id in trades.iter().filter_map(|trade| trade.id.as_deref()) {
                    self.recent_trade_ids.remember(id);
                }
                self.tape = trades;
                ApplyOutcome::Applied {
                    touched: Vec::new(),
                }
            }
            Err(error) => {
                warn!(market, "trade tape fetch failed: {error}");
                ApplyOutcome::Failed
            }
        }
    }

    pub fn apply_order_book(
        &mut self,
        market: &str,
        result: Result<OrderBookSnapshot, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current_market(market) {
            return ApplyOutcome::Discarded;
        }
        match result {
            Ok(snapshot) => {
                self.order_book = snapshot;
                ApplyOutcome::Applied {
                    touched: Vec::new(),
                }
            }
            Err(error) => {
                warn!(market, "order book fetch failed: {error}");
                ApplyOutcome::Failed
            }
        }
    }

    pub fn apply_user_orders(
        &mut self,
        market: &str,
        result: Result<Vec<UserOrder>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current_market(market) {
            return ApplyOutcome::Discarded;
        }
        match result {
            Ok(mut orders) => {
                // Pushed order lists are account-wide.
                orders.retain(|order| order.market.is_empty() || order.market == market);
                self.user_orders = orders;
                ApplyOutcome::Applied {
                    touched: Vec::new(),
                }
            }
            Err(error) => {
                warn!(market, "open orders fetch failed: {error}");
                ApplyOutcome::Failed
            }
        }
    }

    pub fn apply_user_trades(
        &mut self,
        market: &str,
        result: Result<Vec<UserTrade>, AppError>,
    ) -> ApplyOutcome {
        if !self.is_current_market(market) {
            return ApplyOutcome::Discarded;
        }
        match result {
            Ok(trades) => {
                self.user_trades = trades;
                ApplyOutcome::Applied {
                    touched: Vec::new(),
                }
            }
            Err(error) => {
                warn!(market, "user trades fetch failed: {error}");
                ApplyOutcome::Failed
            }
        }
    }

    /// Viewport report from the renderer. Returns the boundary to backfill
    /// from when the left edge is within one bucket of the oldest candle.
    pub fn on_visible_range(&mut self, visible_left_edge_ms: i64) -> Option<i64> {
        self.trigger
            .on_visible_range(visible_left_edge_ms, self.selection.bucket_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::{MarketTimeframe, OrderBookLevel, Side};

    const DAY_MS: i64 = 86_400_000;

    fn daily(market: &str) -> MarketSelection {
        MarketSelection::new(market, MarketTimeframe::D1)
    }

    fn candle(bucket_start: i64, close: f64) -> Candle {
        Candle {
            bucket_start,
            open: close,
            high: close,
            low: close,
            close,
            base_volume: 1.0,
            quote_volume: close,
        }
    }

    fn days(range: std::ops::Range<i64>, close: f64) -> Vec<Candle> {
        range.map(|day| candle(day * DAY_MS, close)).collect()
    }

    fn network_error() -> AppError {
        AppError::Realtime("connection reset".to_string())
    }

    fn loaded(market: &str) -> MarketReconciler {
        let mut reconciler = MarketReconciler::new(daily(market), false);
        let outcome = reconciler.apply_initial_load(&daily(market), Ok(days(10..20, 1.0)));
        assert!(outcome.is_applied());
        reconciler
    }

    #[test]
    fn initial_load_replaces_series_and_arms_trigger() {
        let reconciler = loaded("BTC/USDT");
        assert_eq!(reconciler.series().len(), 10);
        assert_eq!(
            reconciler.trigger().oldest_known_bucket_start(),
            Some(10 * DAY_MS)
        );
    }

    #[test]
    fn refresh_overwrites_shared_buckets_and_reports_changes_only() {
        let mut reconciler = loaded("BTC/USDT");
        let selection = daily("BTC/USDT");

        let mut window = days(15..20, 1.0);
        window.push(candle(20 * DAY_MS, 2.0));
        window[4] = candle(19 * DAY_MS, 3.0);

        let outcome = reconciler.apply_refresh(&selection, Ok(window));
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                touched: vec![19 * DAY_MS, 20 * DAY_MS]
            }
        );
        assert_eq!(reconciler.series().len(), 11);
        assert_eq!(
            reconciler.series().get(19 * DAY_MS).map(|c| c.close),
            Some(3.0)
        );

        let again = reconciler.apply_refresh(&selection, Ok(days(15..19, 1.0)));
        assert_eq!(again, ApplyOutcome::Unchanged);
    }

    #[test]
    fn failures_leave_series_untouched() {
        let mut reconciler = loaded("BTC/USDT");
        let before = reconciler.series().clone();

        assert_eq!(
            reconciler.apply_refresh(&daily("BTC/USDT"), Err(network_error())),
            ApplyOutcome::Failed
        );
        assert_eq!(reconciler.series(), &before);
    }

    #[test]
    fn stale_selection_results_are_discarded() {
        let mut reconciler = loaded("BTC/USDT");
        assert!(reconciler.select(daily("ETH/USDT")));

        let outcome = reconciler.apply_refresh(&daily("BTC/USDT"), Ok(days(0..5, 9.0)));
        assert_eq!(outcome, ApplyOutcome::Discarded);
        assert!(reconciler.series().is_empty());

        let weekly = MarketSelection::new("ETH/USDT", MarketTimeframe::W1);
        let outcome = reconciler.apply_initial_load(&weekly, Ok(days(0..5, 9.0)));
        assert_eq!(outcome, ApplyOutcome::Discarded);
    }

    #[test]
    fn backfill_extends_history_without_overwriting_loaded_buckets() {
        let mut reconciler = loaded("BTC/USDT");
        let selection = daily("BTC/USDT");

        let boundary = reconciler
            .on_visible_range(10 * DAY_MS + 500)
            .expect("near the oldest bucket");
        assert_eq!(boundary, 10 * DAY_MS);
        assert_eq!(reconciler.on_visible_range(10 * DAY_MS + 500), None);

        let outcome = reconciler.apply_backfill(&selection, boundary, Ok(days(5..11, 7.0)));
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                touched: (5..10).map(|day| day * DAY_MS).collect()
            }
        );
        assert_eq!(
            reconciler.series().get(10 * DAY_MS).map(|c| c.close),
            Some(1.0)
        );
        assert_eq!(reconciler.trigger().pending_request_boundary(), None);
        assert_eq!(reconciler.on_visible_range(5 * DAY_MS), Some(5 * DAY_MS));
    }

    #[test]
    fn empty_backfill_keeps_latch_at_start_of_history() {
        let mut reconciler = loaded("BTC/USDT");
        let boundary = reconciler.on_visible_range(0).expect("fires");

        let outcome = reconciler.apply_backfill(&daily("BTC/USDT"), boundary, Ok(Vec::new()));
        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(reconciler.on_visible_range(0), None);
    }

    #[test]
    fn failed_backfill_stays_latched_by_default() {
        let mut reconciler = loaded("BTC/USDT");
        let boundary = reconciler.on_visible_range(0).expect("fires");

        let outcome = reconciler.apply_backfill(&daily("BTC/USDT"), boundary, Err(network_error()));
        assert_eq!(outcome, ApplyOutcome::Failed);
        assert_eq!(reconciler.on_visible_range(0), None);
    }

    #[test]
    fn failed_backfill_can_release_latch_for_retry() {
        let mut reconciler = MarketReconciler::new(daily("BTC/USDT"), true);
        reconciler.apply_initial_load(&daily("BTC/USDT"), Ok(days(10..20, 1.0)));
        let boundary = reconciler.on_visible_range(0).expect("fires");

        reconciler.apply_backfill(&daily("BTC/USDT"), boundary, Err(network_error()));
        assert_eq!(reconciler.on_visible_range(0), Some(boundary));
    }

    #[test]
    fn live_trades_update_latest_bucket_and_replace_tape() {
        let mut reconciler = loaded("BTC/USDT");
        let trades = vec![
            TradeEvent::new(19 * DAY_MS + 2_000, 5.0, 1.0, None, Side::Sell).with_id("b"),
            TradeEvent::new(19 * DAY_MS + 1_000, 0.5, 2.0, None, Side::Buy).with_id("a"),
        ];

        let outcome = reconciler.apply_live_trades("BTC/USDT", trades);
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                touched: vec![19 * DAY_MS]
            }
        );

        let latest = reconciler.series().latest().expect("latest candle");
        assert_eq!(latest.open, 1.0);
        assert_eq!(latest.high, 5.0);
        assert_eq!(latest.low, 0.5);
        assert_eq!(latest.close, 5.0);
        assert_eq!(latest.base_volume, 4.0);
        assert_eq!(reconciler.tape().len(), 2);
        assert_eq!(reconciler.last_trade_at(), Some(19 * DAY_MS + 2_000));
    }

    #[test]
    fn redelivered_trades_are_bucketed_once() {
        let mut reconciler = loaded("BTC/USDT");
        let batch = vec![TradeEvent::new(19 * DAY_MS + 10, 2.0, 1.0, None, Side::Buy).with_id("t-1")];

        reconciler.apply_live_trades("BTC/USDT", batch.clone());
        let outcome = reconciler.apply_live_trades("BTC/USDT", batch);

        assert_eq!(outcome, ApplyOutcome::Applied { touched: Vec::new() });
        assert_eq!(
            reconciler.series().latest().map(|c| c.base_volume),
            Some(2.0)
        );
    }

    #[test]
    fn timeframe_change_keeps_applied_trade_ids() {
        let mut reconciler = loaded("BTC/USDT");
        let batch = vec![TradeEvent::new(19 * DAY_MS + 10, 2.0, 1.0, None, Side::Buy).with_id("t-1")];
        reconciler.apply_live_trades("BTC/USDT", batch.clone());

        let hourly = MarketSelection::new("BTC/USDT", MarketTimeframe::H1);
        assert!(reconciler.select(hourly.clone()));
        reconciler.apply_initial_load(&hourly, Ok(vec![candle(19 * DAY_MS, 2.0)]));

        let outcome = reconciler.apply_live_trades("BTC/USDT", batch);
        assert_eq!(outcome, ApplyOutcome::Applied { touched: Vec::new() });
        assert_eq!(
            reconciler.series().get(19 * DAY_MS).map(|c| c.base_volume),
            Some(1.0)
        );
    }

    #[test]
    fn market_change_forgets_applied_trade_ids() {
        let mut reconciler = loaded("BTC/USDT");
        let trade = TradeEvent::new(19 * DAY_MS + 10, 2.0, 1.0, None, Side::Buy).with_id("t-1");
        reconciler.apply_live_trades("BTC/USDT", vec![trade.clone()]);

        reconciler.select(daily("ETH/USDT"));
        reconciler.apply_initial_load(&daily("ETH/USDT"), Ok(days(10..20, 1.0)));
        let outcome = reconciler.apply_live_trades("ETH/USDT", vec![trade]);
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                touched: vec![19 * DAY_MS]
            }
        );
    }

    #[test]
    fn rest_tape_ids_are_never_bucketed() {
        let mut reconciler = loaded("BTC/USDT");
        let trade = TradeEvent::new(19 * DAY_MS + 10, 2.0, 1.0, None, Side::Buy).with_id("t-9");
        reconciler.apply_tape("BTC/USDT", Ok(vec![trade.clone()]));

        let outcome = reconciler.apply_live_trades("BTC/USDT", vec![trade]);
        assert_eq!(outcome, ApplyOutcome::Applied { touched: Vec::new() });
        assert_eq!(
            reconciler.series().latest().map(|c| c.base_volume),
            Some(1.0)
        );
    }

    #[test]
    fn live_trades_for_another_market_are_dropped() {
        let mut reconciler = loaded("BTC/USDT");
        let outcome = reconciler.apply_live_trades(
            "ETH/USDT",
            vec![TradeEvent::new(19 * DAY_MS, 2.0, 1.0, None, Side::Buy)],
        );
        assert_eq!(outcome, ApplyOutcome::Discarded);
        assert!(reconciler.tape().is_empty());
    }

    #[test]
    fn order_book_push_replaces_snapshot() {
        let mut reconciler = loaded("BTC/USDT");
        let first = OrderBookSnapshot {
            bids: vec![OrderBookLevel {
                price: 1.0,
                amount: 1.0,
            }],
            asks: Vec::new(),
        };
        reconciler.apply_order_book("BTC/USDT", Ok(first));
        reconciler.apply_order_book("BTC/USDT", Ok(OrderBookSnapshot::default()));

        assert!(reconciler.order_book().bids.is_empty());
        assert_eq!(
            reconciler.apply_order_book("BTC/USDT", Err(network_error())),
            ApplyOutcome::Failed
        );
    }

    #[test]
    fn timeframe_change_keeps_book_but_resets_series() {
        let mut reconciler = loaded("BTC/USDT");
        reconciler.apply_tape(
            "BTC/USDT",
            Ok(vec![TradeEvent::new(1, 1.0, 1.0, None, Side::Buy)]),
        );

        assert!(reconciler.select(MarketSelection::new("BTC/USDT", MarketTimeframe::H1)));
        assert!(reconciler.series().is_empty());
        assert_eq!(reconciler.trigger(), &BackfillTrigger::default());
        assert_eq!(reconciler.tape().len(), 1);

        assert!(!reconciler.select(MarketSelection::new("BTC/USDT", MarketTimeframe::H1)));
        assert!(reconciler.select(daily("ETH/USDT")));
        assert!(reconciler.tape().is_empty());
    }

    #[test]
    fn user_orders_keep_only_active_market() {
        let mut reconciler = loaded("BTC/USDT");
        let order = |id: &str, market: &str| UserOrder {
            id: id.to_string(),
            market: market.to_string(),
            side: Side::Buy,
            price: 1.0,
            amount: 1.0,
            remaining: 1.0,
            status: "open".to_string(),
            created_at: None,
        };

        reconciler.apply_user_orders(
            "BTC/USDT",
            Ok(vec![order("a", "BTC/USDT"), order("b", "ETH/USDT"), order("c", "")]),
        );
        let ids: Vec<&str> = reconciler
            .user_orders()
            .iter()
            .map(|order| order.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn recent_trade_ids_evict_oldest() {
        let mut ids = RecentTradeIds::with_capacity(2);
        assert!(ids.remember("a"));
        assert!(ids.remember("b"));
        assert!(!ids.remember("a"));
        assert!(ids.remember("c"));

        assert_eq!(ids.order.len(), 2);
        assert!(!ids.seen.contains("a"));
        assert!(ids.seen.contains("c"));
    }
}
