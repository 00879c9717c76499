use crate::error::AppError;
use crate::market::book::OrderBookLadder;
use crate::market::config::ReconcilerConfig;
use crate::market::reconciler::{ApplyOutcome, MarketReconciler};
use crate::market::source::MarketDataSource;
use crate::market::types::{
    Candle, MarketConnectionState, MarketSelection, MarketStreamStatusSnapshot, MarketTimeframe,
    OrderBookSnapshot, TradeEvent, UserOrder, UserTrade,
};
use crate::realtime::{run_realtime, RealtimeConfig, RealtimePush, RealtimeSignal};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const STATUS_HEARTBEAT_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const REALTIME_SIGNAL_CAPACITY: usize = 256;

/// Selection change where omitted fields keep the value active when the
/// stream task handles it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionChange {
    pub market: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
}

impl SelectionChange {
    pub fn resolve(&self, current: &MarketSelection) -> MarketSelection {
        MarketSelection::new(
            self.market
                .clone()
                .unwrap_or_else(|| current.market.clone()),
            self.timeframe.unwrap_or(current.timeframe),
        )
    }
}

/// Control input from the rendering layer.
#[derive(Debug)]
pub enum MarketCommand {
    /// `reply` receives the selection the change resolved to.
    Select {
        change: SelectionChange,
        reply: Option<oneshot::Sender<MarketSelection>>,
    },
    VisibleRange { left_edge_ms: i64 },
    ReloadUserFeeds,
}

impl MarketCommand {
    pub fn select(change: SelectionChange) -> (Self, oneshot::Receiver<MarketSelection>) {
        let (reply, resolved) = oneshot::channel();
        (
            Self::Select {
                change,
                reply: Some(reply),
            },
            resolved,
        )
    }
}

/// Ends of the push channel the stream task listens on. `task` is the
/// connection task, awaited on shutdown.
pub struct RealtimeLink {
    pub signals: mpsc::Receiver<RealtimeSignal>,
    pub market_tx: watch::Sender<String>,
    pub task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MarketEvent {
    Status(MarketStreamStatusSnapshot),
    #[serde(rename_all = "camelCase")]
    CandlesBootstrap {
        selection: MarketSelection,
        candles: Vec<Candle>,
    },
    /// Only the buckets that changed; merge by `bucketStart`.
    #[serde(rename_all = "camelCase")]
    CandlesUpdated {
        selection: MarketSelection,
        candles: Vec<Candle>,
    },
    #[serde(rename_all = "camelCase")]
    NeedMoreLeft {
        selection: MarketSelection,
        oldest_bucket_start: i64,
    },
    #[serde(rename_all = "camelCase")]
    OrderBook {
        market: String,
        ladder: OrderBookLadder,
    },
    #[serde(rename_all = "camelCase")]
    Tape {
        market: String,
        trades: Vec<TradeEvent>,
    },
    #[serde(rename_all = "camelCase")]
    MyOrders {
        market: String,
        orders: Vec<UserOrder>,
    },
    #[serde(rename_all = "camelCase")]
    MyTrades {
        market: String,
        trades: Vec<UserTrade>,
    },
}

/// Latest reconciled state for pull-style rendering.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    pub selection: Option<MarketSelection>,
    pub candles: Vec<Candle>,
    pub order_book: OrderBookSnapshot,
    pub ladder: OrderBookLadder,
    pub tape: Vec<TradeEvent>,
    pub user_orders: Vec<UserOrder>,
    pub user_trades: Vec<UserTrade>,
}

/// Shared handles the stream task publishes into.
#[derive(Clone)]
pub struct MarketStreamContext {
    pub source: Arc<dyn MarketDataSource>,
    /// `None` runs on REST polling alone.
    pub realtime: Option<RealtimeConfig>,
    pub user_feeds: bool,
    pub status_store: Arc<RwLock<MarketStreamStatusSnapshot>>,
    pub view: Arc<Mutex<MarketView>>,
    pub events: broadcast::Sender<MarketEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandleFetch {
    Initial,
    Refresh,
    Backfill { boundary: i64 },
}

enum FetchOutcome {
    Candles {
        origin: MarketSelection,
        kind: CandleFetch,
        result: Result<Vec<Candle>, AppError>,
    },
    OrderBook {
        market: String,
        result: Result<OrderBookSnapshot, AppError>,
    },
    Tape {
        market: String,
        result: Result<Vec<TradeEvent>, AppError>,
    },
    UserOrders {
        market: String,
        result: Result<Vec<UserOrder>, AppError>,
    },
    UserTrades {
        market: String,
        result: Result<Vec<UserTrade>, AppError>,
    },
}

#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_state: Option<MarketConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

fn allow_status_publish(
    throttle: &mut StatusPublishThrottle,
    state: MarketConnectionState,
    reason: &Option<String>,
) -> bool {
    let now = Instant::now();
    let should_throttle = matches!(
        state,
        MarketConnectionState::Error | MarketConnectionState::Reconnecting
    );

    if should_throttle
        && throttle.last_state == Some(state)
        && throttle.last_reason == *reason
        && throttle
            .last_emit
            .map(|instant| {
                now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
            })
            .unwrap_or(false)
    {
        return false;
    }

    throttle.last_state = Some(state);
    throttle.last_reason = reason.clone();
    throttle.last_emit = Some(now);
    true
}

fn candle_failure_reason(error: &AppError) -> String {
    if error.is_network() {
        format!("backend unreachable: {error}")
    } else if error.is_malformed() {
        format!("backend sent malformed candles: {error}")
    } else {
        error.to_string()
    }
}

struct StreamRuntime {
    config: ReconcilerConfig,
    context: MarketStreamContext,
    reconciler: MarketReconciler,
    pending: FuturesUnordered<BoxFuture<'static, FetchOutcome>>,
    refresh_in_flight: Option<MarketSelection>,
    candles_loaded: bool,
    realtime_enabled: bool,
    realtime_live: bool,
    realtime_dropped: bool,
    realtime_failed: bool,
    reason: Option<String>,
    throttle: StatusPublishThrottle,
    market_tx: Option<watch::Sender<String>>,
}

impl StreamRuntime {
    fn new(config: ReconcilerConfig, context: MarketStreamContext) -> Self {
        let reconciler =
            MarketReconciler::new(config.selection.clone(), config.retry_backfill_on_failure);
        Self {
            config,
            context,
            reconciler,
            pending: FuturesUnordered::new(),
            refresh_in_flight: None,
            candles_loaded: false,
            realtime_enabled: false,
            realtime_live: false,
            realtime_dropped: false,
            realtime_failed: false,
            reason: None,
            throttle: StatusPublishThrottle::default(),
            market_tx: None,
        }
    }

    fn phase(&self) -> MarketConnectionState {
        if self.realtime_failed {
            return MarketConnectionState::Error;
        }
        if self.realtime_dropped {
            return MarketConnectionState::Reconnecting;
        }
        if !self.candles_loaded || (self.realtime_enabled && !self.realtime_live) {
            return MarketConnectionState::Connecting;
        }
        MarketConnectionState::Live
    }

    fn emit(&self, event: MarketEvent) {
        // No subscribers is not an error.
        let _ = self.context.events.send(event);
    }

    fn status_snapshot(
        &self,
        state: MarketConnectionState,
        reason: Option<String>,
    ) -> MarketStreamStatusSnapshot {
        let selection = self.reconciler.selection();
        let series = self.reconciler.series();
        MarketStreamStatusSnapshot {
            state,
            market: selection.market.clone(),
            timeframe: selection.timeframe,
            candle_count: series.len(),
            oldest_bucket_start: series.oldest_bucket_start(),
            newest_bucket_start: series.newest_bucket_start(),
            last_trade_at: self.reconciler.last_trade_at(),
            reason,
        }
    }

    async fn publish_status(&mut self, state: MarketConnectionState, reason: Option<String>) {
        if !allow_status_publish(&mut self.throttle, state, &reason) {
            return;
        }

        let snapshot = self.status_snapshot(state, reason.clone());
        self.reason = reason;
        {
            let mut writable = self.context.status_store.write().await;
            if *writable == snapshot {
                return;
            }
            *writable = snapshot.clone();
        }
        self.emit(MarketEvent::Status(snapshot));
    }

    async fn publish_phase(&mut self, reason: Option<String>) {
        self.publish_status(self.phase(), reason).await;
    }

    async fn republish_status(&mut self) {
        let reason = self.reason.clone();
        self.publish_phase(reason).await;
    }

    fn sync_view(&self) {
        let view = MarketView {
            selection: Some(self.reconciler.selection().clone()),
            candles: self.reconciler.series().to_vec(),
            order_book: self.reconciler.order_book().clone(),
            ladder: self
                .reconciler
                .order_book()
                .ladder(usize::from(self.config.orderbook_depth)),
            tape: self.reconciler.tape().to_vec(),
            user_orders: self.reconciler.user_orders().to_vec(),
            user_trades: self.reconciler.user_trades().to_vec(),
        };
        *self.context.view.lock() = view;
    }

    fn request_candles(&mut self, kind: CandleFetch) {
        let origin = self.reconciler.selection().clone();
        let (limit, to) = match kind {
            CandleFetch::Initial => (self.config.initial_limit, None),
            CandleFetch::Refresh => (self.config.refresh_limit, None),
            CandleFetch::Backfill { boundary } => (self.config.backfill_limit, Some(boundary)),
        };
        if kind == CandleFetch::Refresh {
            self.refresh_in_flight = Some(origin.clone());
        }

        let source = Arc::clone(&self.context.source);
        self.pending.push(
            async move {
                let result = source.fetch_candles(&origin, limit, to).await;
                FetchOutcome::Candles {
                    origin,
                    kind,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn request_market_snapshots(&mut self) {
        let market = self.reconciler.selection().market.clone();
        let depth = self.config.orderbook_depth;
        let tape_limit = self.config.tape_limit;

        let source = Arc::clone(&self.context.source);
        let book_market = market.clone();
        self.pending.push(
            async move {
                let result = source.fetch_order_book(&book_market, depth).await;
                FetchOutcome::OrderBook {
                    market: book_market,
                    result,
                }
            }
            .boxed(),
        );

        let source = Arc::clone(&self.context.source);
        self.pending.push(
            async move {
                let result = source.fetch_trades(&market, tape_limit).await;
                FetchOutcome::Tape { market, result }
            }
            .boxed(),
        );
    }

    fn request_user_feeds(&mut self) {
        if !self.context.user_feeds {
            return;
        }
        let market = self.reconciler.selection().market.clone();

        let source = Arc::clone(&self.context.source);
        let orders_market = market.clone();
        self.pending.push(
            async move {
                let result = source.fetch_user_orders(&orders_market).await;
                FetchOutcome::UserOrders {
                    market: orders_market,
                    result,
                }
            }
            .boxed(),
        );

        let source = Arc::clone(&self.context.source);
        self.pending.push(
            async move {
                let result = source
                    .fetch_user_trades(&market, crate::market::config::DEFAULT_USER_TRADES_LIMIT)
                    .await;
                FetchOutcome::UserTrades { market, result }
            }
            .boxed(),
        );
    }

    fn load_selection(&mut self, market_changed: bool) {
        self.request_candles(CandleFetch::Initial);
        if market_changed {
            self.request_market_snapshots();
            self.request_user_feeds();
        }
    }

    fn on_refresh_tick(&mut self) {
        if self.refresh_in_flight.as_ref() != Some(self.reconciler.selection()) {
            self.request_candles(CandleFetch::Refresh);
        }
        if !self.realtime_live {
            self.request_market_snapshots();
        }
    }

    async fn apply_selection(&mut self, selection: MarketSelection) {
        let market_changed = selection.market != self.reconciler.selection().market;
        if !self.reconciler.select(selection) {
            return;
        }

        let selection = self.reconciler.selection().clone();
        info!(
            market = %selection.market,
            timeframe = selection.timeframe.as_str(),
            "market selection changed"
        );
        self.refresh_in_flight = None;
        self.candles_loaded = false;
        if market_changed {
            if let Some(market_tx) = &self.market_tx {
                market_tx.send_replace(selection.market.clone());
            }
        }

        self.sync_view();
        self.load_selection(market_changed);
        self.publish_phase(Some("loading candles".to_string())).await;
    }

    async fn handle_command(&mut self, command: MarketCommand) {
        match command {
            MarketCommand::Select { change, reply } => {
                let selection = change.resolve(self.reconciler.selection());
                self.apply_selection(selection.clone()).await;
                if let Some(reply) = reply {
                    // The caller may have stopped waiting.
                    let _ = reply.send(selection);
                }
            }
            MarketCommand::VisibleRange { left_edge_ms } => {
                let Some(boundary) = self.reconciler.on_visible_range(left_edge_ms) else {
                    return;
                };
                debug!(boundary, "requesting older candles");
                self.emit(MarketEvent::NeedMoreLeft {
                    selection: self.reconciler.selection().clone(),
                    oldest_bucket_start: boundary,
                });
                self.request_candles(CandleFetch::Backfill { boundary });
            }
            MarketCommand::ReloadUserFeeds => self.request_user_feeds(),
        }
    }

    async fn handle_fetch(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Candles {
                origin,
                kind,
                result,
            } => {
                if kind == CandleFetch::Refresh && self.refresh_in_flight.as_ref() == Some(&origin)
                {
                    self.refresh_in_flight = None;
                }
                let failure = result.as_ref().err().map(candle_failure_reason);

                let applied = match kind {
                    CandleFetch::Initial => self.reconciler.apply_initial_load(&origin, result),
                    CandleFetch::Refresh => self.reconciler.apply_refresh(&origin, result),
                    CandleFetch::Backfill { boundary } => {
                        self.reconciler.apply_backfill(&origin, boundary, result)
                    }
                };
                self.on_candles_applied(kind, applied, failure).await;
            }
            FetchOutcome::OrderBook { market, result } => {
                let applied = self.reconciler.apply_order_book(&market, result);
                self.on_book_applied(market, applied);
            }
            FetchOutcome::Tape { market, result } => {
                let applied = self.reconciler.apply_tape(&market, result);
                self.on_tape_applied(market, applied);
            }
            FetchOutcome::UserOrders { market, result } => {
                let applied = self.reconciler.apply_user_orders(&market, result);
                self.on_user_orders_applied(market, applied);
            }
            FetchOutcome::UserTrades { market, result } => {
                let applied = self.reconciler.apply_user_trades(&market, result);
                self.on_user_trades_applied(market, applied);
            }
        }
    }

    async fn on_candles_applied(
        &mut self,
        kind: CandleFetch,
        applied: ApplyOutcome,
        failure: Option<String>,
    ) {
        match applied {
            ApplyOutcome::Applied { touched } => {
                let first_load = !self.candles_loaded;
                self.candles_loaded = true;
                self.sync_view();

                let selection = self.reconciler.selection().clone();
                if kind == CandleFetch::Initial {
                    self.emit(MarketEvent::CandlesBootstrap {
                        selection,
                        candles: self.reconciler.series().to_vec(),
                    });
                } else {
                    self.emit(MarketEvent::CandlesUpdated {
                        selection,
                        candles: self.reconciler.candles(&touched),
                    });
                }

                if first_load {
                    self.publish_phase(Some("candles loaded".to_string())).await;
                }
            }
            ApplyOutcome::Failed if !self.candles_loaded => {
                let reason = failure.unwrap_or_else(|| "unknown error".to_string());
                self.publish_phase(Some(format!(
                    "candle load failed, retrying on next refresh: {reason}"
                )))
                .await;
            }
            _ => {}
        }
    }

    fn on_book_applied(&self, market: String, applied: ApplyOutcome) {
        if !applied.is_applied() {
            return;
        }
        self.sync_view();
        self.emit(MarketEvent::OrderBook {
            market,
            ladder: self
                .reconciler
                .order_book()
                .ladder(usize::from(self.config.orderbook_depth)),
        });
    }

    fn on_tape_applied(&self, market: String, applied: ApplyOutcome) {
        if !applied.is_applied() {
            return;
        }
        self.sync_view();
        self.emit(MarketEvent::Tape {
            market,
            trades: self.reconciler.tape().to_vec(),
        });
    }

    fn on_user_orders_applied(&self, market: String, applied: ApplyOutcome) {
        if !applied.is_applied() {
            return;
        }
        self.sync_view();
        self.emit(MarketEvent::MyOrders {
            market,
            orders: self.reconciler.user_orders().to_vec(),
        });
    }

    fn on_user_trades_applied(&self, market: String, applied: ApplyOutcome) {
        if !applied.is_applied() {
            return;
        }
        self.sync_view();
        self.emit(MarketEvent::MyTrades {
            market,
            trades: self.reconciler.user_trades().to_vec(),
        });
    }

    async fn handle_signal(&mut self, signal: RealtimeSignal) {
        match signal {
            RealtimeSignal::Connected => {
                self.realtime_live = true;
                self.realtime_dropped = false;
                self.publish_phase(Some("realtime connected".to_string()))
                    .await;
            }
            RealtimeSignal::Disconnected { reason } => {
                self.realtime_live = false;
                self.realtime_dropped = true;
                self.publish_phase(Some(reason)).await;
            }
            RealtimeSignal::Push { market, push } => self.handle_push(market, push),
        }
    }

    fn handle_push(&mut self, market: String, push: RealtimePush) {
        match push {
            RealtimePush::Trades(trades) => {
                let applied = self.reconciler.apply_live_trades(&market, trades);
                let ApplyOutcome::Applied { touched } = applied else {
                    return;
                };
                if !touched.is_empty() {
                    self.emit(MarketEvent::CandlesUpdated {
                        selection: self.reconciler.selection().clone(),
                        candles: self.reconciler.candles(&touched),
                    });
                }
                self.on_tape_applied(market, ApplyOutcome::Applied { touched });
            }
            RealtimePush::OrderBook(snapshot) => {
                let applied = self.reconciler.apply_order_book(&market, Ok(snapshot));
                self.on_book_applied(market, applied);
            }
            RealtimePush::MyOrders(orders) => {
                let applied = self.reconciler.apply_user_orders(&market, Ok(orders));
                self.on_user_orders_applied(market, applied);
            }
            RealtimePush::MyTrades(trades) => {
                let applied = self.reconciler.apply_user_trades(&market, Ok(trades));
                self.on_user_trades_applied(market, applied);
            }
        }
    }
}

/// Drives one reconciler until `cancel_token` fires or every command sender
/// is dropped. Fetch completions, realtime pushes, timer ticks and commands
/// interleave on this single task.
pub async fn run_market_stream(
    config: ReconcilerConfig,
    context: MarketStreamContext,
    commands: mpsc::Receiver<MarketCommand>,
    cancel_token: CancellationToken,
) {
    let realtime = match (config.realtime, context.realtime.clone()) {
        (true, Some(realtime_config)) => {
            let (signal_tx, signals) = mpsc::channel(REALTIME_SIGNAL_CAPACITY);
            let (market_tx, market_rx) = watch::channel(config.selection.market.clone());
            let task = tokio::spawn(run_realtime(
                realtime_config,
                market_rx,
                signal_tx,
                cancel_token.child_token(),
            ));
            Some(RealtimeLink {
                signals,
                market_tx,
                task: Some(task),
            })
        }
        _ => None,
    };

    drive_market_stream(config, context, commands, realtime, cancel_token).await;
}

pub(crate) async fn drive_market_stream(
    config: ReconcilerConfig,
    context: MarketStreamContext,
    mut commands: mpsc::Receiver<MarketCommand>,
    realtime: Option<RealtimeLink>,
    cancel_token: CancellationToken,
) {
    let mut runtime = StreamRuntime::new(config, context);
    let (mut signal_rx, realtime_handle) = match realtime {
        Some(link) => {
            runtime.market_tx = Some(link.market_tx);
            (link.signals, link.task)
        }
        None => {
            let (_, signals) = mpsc::channel(1);
            (signals, None)
        }
    };

    let mut realtime_open = runtime.market_tx.is_some();
    runtime.realtime_enabled = realtime_open;

    info!(
        market = %runtime.reconciler.selection().market,
        timeframe = runtime.reconciler.selection().timeframe.as_str(),
        realtime = realtime_open,
        "market stream started"
    );
    runtime.sync_view();
    runtime.load_selection(true);
    runtime
        .publish_phase(Some("loading candles".to_string()))
        .await;

    let period = Duration::from_millis(runtime.config.refresh_interval_ms);
    let mut refresh_ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(STATUS_HEARTBEAT_MS));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                runtime.handle_command(command).await;
            }
            Some(outcome) = runtime.pending.next(), if !runtime.pending.is_empty() => {
                runtime.handle_fetch(outcome).await;
            }
            signal = signal_rx.recv(), if realtime_open => {
                match signal {
                    Some(signal) => runtime.handle_signal(signal).await,
                    None => {
                        realtime_open = false;
                        runtime.realtime_live = false;
                        runtime.realtime_failed = true;
                        runtime
                            .publish_phase(Some("realtime channel stopped".to_string()))
                            .await;
                    }
                }
            }
            _ = refresh_ticker.tick() => runtime.on_refresh_tick(),
            _ = heartbeat.tick() => runtime.republish_status().await,
        }
    }

    cancel_token.cancel();
    if let Some(handle) = realtime_handle {
        let _ = handle.await;
    }

    runtime
        .publish_status(
            MarketConnectionState::Stopped,
            Some("stream stopped".to_string()),
        )
        .await;
    info!("market stream stopped");
}
