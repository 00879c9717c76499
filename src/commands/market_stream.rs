use crate::error::AppError;
use crate::market::config::{normalize_market, StartMarketStreamArgs};
use crate::market::pipeline::{
    run_market_stream, MarketCommand, MarketStreamContext, MarketView, SelectionChange,
};
use crate::market::types::{
    MarketConnectionState, MarketSelection, MarketStreamStatusSnapshot, MarketTimeframe,
};
use crate::realtime::RealtimeConfig;
use crate::state::{AppState, MarketStreamHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamSession {
    pub market: String,
    pub timeframe: MarketTimeframe,
    pub refresh_interval_ms: u64,
    pub realtime: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStreamStopResult {
    pub stopped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectMarketArgs {
    pub market: Option<String>,
    pub timeframe: Option<MarketTimeframe>,
}

async fn take_running_stream(state: &AppState) -> Option<MarketStreamHandle> {
    let mut stream_slot = state.market_stream.lock().await;
    stream_slot.take()
}

async fn send_command(state: &AppState, command: MarketCommand) -> Result<(), AppError> {
    let commands = {
        let stream_slot = state.market_stream.lock().await;
        stream_slot
            .as_ref()
            .map(|handle| handle.commands.clone())
            .ok_or(AppError::StreamNotRunning)?
    };
    commands
        .send(command)
        .await
        .map_err(|_| AppError::StreamNotRunning)
}

pub async fn start_market_stream(
    state: &AppState,
    args: Option<StartMarketStreamArgs>,
) -> Result<MarketStreamSession, AppError> {
    let mut args = args.unwrap_or_default();
    let has_market = args
        .market
        .as_deref()
        .is_some_and(|market| !market.trim().is_empty());
    if !has_market {
        args.market = state.source.fetch_markets().await?.into_iter().next();
    }
    let config = args.normalize()?;

    if let Some(handle) = take_running_stream(state).await {
        handle.cancellation_token.cancel();
        let _ = handle.join_handle.await;
    }

    let realtime = if config.realtime {
        Some(RealtimeConfig {
            endpoint: state.session.realtime_endpoint()?,
            token: state.session.token().map(str::to_string),
        })
    } else {
        None
    };
    let context = MarketStreamContext {
        source: Arc::clone(&state.source),
        realtime,
        user_feeds: state.session.is_authenticated(),
        status_store: Arc::clone(&state.market_status),
        view: Arc::clone(&state.market_view),
        events: state.events.clone(),
    };

    let cancellation_token = CancellationToken::new();
    let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let join_handle = tokio::spawn(run_market_stream(
        config.clone(),
        context,
        commands_rx,
        cancellation_token.clone(),
    ));

    {
        let mut stream_slot = state.market_stream.lock().await;
        *stream_slot = Some(MarketStreamHandle {
            cancellation_token,
            join_handle,
            commands,
        });
    }

    info!(market = %config.selection.market, "market stream session started");
    Ok(MarketStreamSession {
        market: config.selection.market,
        timeframe: config.selection.timeframe,
        refresh_interval_ms: config.refresh_interval_ms,
        realtime: config.realtime,
    })
}

pub async fn stop_market_stream(state: &AppState) -> Result<MarketStreamStopResult, AppError> {
    let stopped = match take_running_stream(state).await {
        Some(handle) => {
            handle.cancellation_token.cancel();
            let _ = handle.join_handle.await;
            true
        }
        None => false,
    };

    {
        let mut writable = state.market_status.write().await;
        writable.state = MarketConnectionState::Stopped;
        writable.reason = Some("stream stopped by command".to_string());
    }

    Ok(MarketStreamStopResult { stopped })
}

pub async fn market_stream_status(
    state: &AppState,
) -> Result<MarketStreamStatusSnapshot, AppError> {
    let snapshot = state.market_status.read().await.clone();
    Ok(snapshot)
}

pub async fn market_view(state: &AppState) -> Result<MarketView, AppError> {
    Ok(state.market_view.lock().clone())
}

/// Switches market and/or timeframe of the running stream. Omitted fields keep
/// the value active when the stream task handles the change, so consecutive
/// calls compose in order.
pub async fn select_market(
    state: &AppState,
    args: SelectMarketArgs,
) -> Result<MarketSelection, AppError> {
    let change = SelectionChange {
        market: args.market.as_deref().map(normalize_market).transpose()?,
        timeframe: args.timeframe,
    };

    let (command, resolved) = MarketCommand::select(change);
    send_command(state, command).await?;
    resolved.await.map_err(|_| AppError::StreamNotRunning)
}

pub async fn report_visible_range(state: &AppState, left_edge_ms: i64) -> Result<(), AppError> {
    send_command(state, MarketCommand::VisibleRange { left_edge_ms }).await
}

pub async fn market_symbols(state: &AppState) -> Result<Vec<String>, AppError> {
    state.source.fetch_markets().await
}

pub(crate) async fn reload_user_feeds(state: &AppState) {
    // A stopped stream has nothing to reload.
    let _ = send_command(state, MarketCommand::ReloadUserFeeds).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::pipeline::MarketEvent;
    use crate::market::source::mock::MockSource;
    use crate::market::types::Candle;
    use crate::session::Session;
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    fn candles(count: i64, close: f64) -> Vec<Candle> {
        (0..count)
            .map(|day| Candle {
                bucket_start: day * 86_400_000,
                open: close,
                high: close,
                low: close,
                close,
                base_volume: 1.0,
                quote_volume: close,
            })
            .collect()
    }

    fn app_state(source: MockSource) -> AppState {
        let source = Arc::new(source);
        let session = Session::new("http://localhost:8080").expect("valid url");
        AppState::with_backend(session, source.clone(), source)
    }

    fn polling_args(market: Option<&str>) -> Option<StartMarketStreamArgs> {
        Some(StartMarketStreamArgs {
            market: market.map(str::to_string),
            realtime: Some(false),
            ..StartMarketStreamArgs::default()
        })
    }

    async fn wait_for_bootstrap(
        events: &mut tokio::sync::broadcast::Receiver<MarketEvent>,
        market: &str,
        timeframe: MarketTimeframe,
    ) -> Vec<Candle> {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match events.recv().await {
                    Ok(MarketEvent::CandlesBootstrap { selection, candles })
                        if selection.market == market && selection.timeframe == timeframe =>
                    {
                        return candles;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("bootstrap should arrive")
    }

    #[tokio::test]
    async fn start_defaults_to_first_listed_market() {
        let mut source = MockSource::with_candles("ETH/USDT", candles(3, 1.0));
        source.markets = vec!["ETH/USDT".to_string(), "BTC/USDT".to_string()];
        let state = app_state(source);
        let mut events = state.subscribe();

        let session = start_market_stream(&state, polling_args(None))
            .await
            .expect("stream starts");
        assert_eq!(session.market, "ETH/USDT");
        assert!(!session.realtime);

        let bootstrap = wait_for_bootstrap(&mut events, "ETH/USDT", MarketTimeframe::D1).await;
        assert_eq!(bootstrap.len(), 3);

        let stopped = stop_market_stream(&state).await.expect("stop succeeds");
        assert!(stopped.stopped);
        let status = market_stream_status(&state).await.expect("status");
        assert_eq!(status.state, MarketConnectionState::Stopped);
    }

    #[tokio::test]
    async fn start_without_any_market_fails() {
        let state = app_state(MockSource::default());
        let result = start_market_stream(&state, polling_args(None)).await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn select_keeps_market_when_only_timeframe_changes() {
        let source = MockSource::with_candles("BTC/USDT", candles(4, 1.0));
        let state = app_state(source);
        let mut events = state.subscribe();

        start_market_stream(&state, polling_args(Some("BTC/USDT")))
            .await
            .expect("stream starts");
        wait_for_bootstrap(&mut events, "BTC/USDT", MarketTimeframe::D1).await;

        let selection = select_market(
            &state,
            SelectMarketArgs {
                market: None,
                timeframe: Some(MarketTimeframe::H1),
            },
        )
        .await
        .expect("select succeeds");
        assert_eq!(
            selection,
            MarketSelection::new("BTC/USDT", MarketTimeframe::H1)
        );
        wait_for_bootstrap(&mut events, "BTC/USDT", MarketTimeframe::H1).await;

        let view = market_view(&state).await.expect("view");
        assert_eq!(view.selection, Some(selection));

        stop_market_stream(&state).await.expect("stop succeeds");
    }

    #[tokio::test]
    async fn consecutive_partial_selects_compose() {
        let source = MockSource::with_candles("BTC/USDT", candles(4, 1.0));
        source
            .candles
            .lock()
            .insert("ETH/USDT".to_string(), candles(6, 2.0));
        let state = app_state(source);
        let mut events = state.subscribe();

        start_market_stream(&state, polling_args(Some("BTC/USDT")))
            .await
            .expect("stream starts");
        wait_for_bootstrap(&mut events, "BTC/USDT", MarketTimeframe::D1).await;

        let first = select_market(
            &state,
            SelectMarketArgs {
                market: Some("ETH/USDT".to_string()),
                timeframe: None,
            },
        )
        .await
        .expect("market switch");
        let second = select_market(
            &state,
            SelectMarketArgs {
                market: None,
                timeframe: Some(MarketTimeframe::H1),
            },
        )
        .await
        .expect("timeframe switch");

        assert_eq!(first, MarketSelection::new("ETH/USDT", MarketTimeframe::D1));
        assert_eq!(second, MarketSelection::new("ETH/USDT", MarketTimeframe::H1));
        wait_for_bootstrap(&mut events, "ETH/USDT", MarketTimeframe::H1).await;
        assert_eq!(
            market_view(&state).await.expect("view").selection,
            Some(second)
        );

        stop_market_stream(&state).await.expect("stop succeeds");
    }

    #[tokio::test]
    async fn commands_require_running_stream() {
        let state = app_state(MockSource::default());

        assert!(matches!(
            report_visible_range(&state, 0).await,
            Err(AppError::StreamNotRunning)
        ));
        assert!(matches!(
            select_market(&state, SelectMarketArgs::default()).await,
            Err(AppError::StreamNotRunning)
        ));
        let stopped = stop_market_stream(&state).await.expect("stop succeeds");
        assert!(!stopped.stopped);
    }

    #[tokio::test]
    async fn restarting_replaces_previous_stream() {
        let mut source = MockSource::with_candles("AAA", candles(2, 1.0));
        source
            .candles
            .lock()
            .insert("BBB".to_string(), candles(5, 2.0));
        let state = app_state(source);
        let mut events = state.subscribe();

        start_market_stream(&state, polling_args(Some("AAA")))
            .await
            .expect("first start");
        start_market_stream(&state, polling_args(Some("BBB")))
            .await
            .expect("second start");

        let bootstrap = wait_for_bootstrap(&mut events, "BBB", MarketTimeframe::D1).await;
        assert_eq!(bootstrap.len(), 5);
        assert_eq!(
            market_stream_status(&state).await.expect("status").market,
            "BBB"
        );

        stop_market_stream(&state).await.expect("stop succeeds");
    }
}
