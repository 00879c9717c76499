pub mod commands;
pub mod error;
pub mod logging;
pub mod market;
pub mod realtime;
pub mod session;
pub mod state;

use commands::market_stream::{start_market_stream, stop_market_stream};
use error::AppError;
use market::config::StartMarketStreamArgs;
use market::pipeline::MarketEvent;
use session::Session;
use state::AppState;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Headless runner: streams the market named by the environment and logs
/// every published event until Ctrl-C.
pub async fn run() -> Result<(), AppError> {
    let session = Session::from_env()?;
    let args = StartMarketStreamArgs::from_env()?;
    info!(
        base_url = %session.endpoint("")?,
        authenticated = session.is_authenticated(),
        role = session.role(),
        email = session.email().unwrap_or_default(),
        "terminal market data starting"
    );

    let state = AppState::new(session)?;
    let mut events = state.subscribe();
    let started = start_market_stream(&state, Some(args)).await?;
    info!(
        market = %started.market,
        timeframe = started.timeframe.as_str(),
        realtime = started.realtime,
        "streaming"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    stop_market_stream(&state).await?;
    Ok(())
}

fn log_event(event: &MarketEvent) {
    match event {
        MarketEvent::Status(status) => info!(
            state = ?status.state,
            candles = status.candle_count,
            reason = status.reason.as_deref().unwrap_or_default(),
            "status"
        ),
        MarketEvent::CandlesBootstrap { selection, candles } => info!(
            market = %selection.market,
            timeframe = selection.timeframe.as_str(),
            count = candles.len(),
            "candles loaded"
        ),
        MarketEvent::CandlesUpdated { candles, .. } => {
            debug!(count = candles.len(), "candles updated")
        }
        MarketEvent::NeedMoreLeft {
            oldest_bucket_start,
            ..
        } => debug!(oldest_bucket_start, "loading older candles"),
        MarketEvent::OrderBook { market, ladder } => debug!(
            market = %market,
            best_bid = ladder.best_bid,
            best_ask = ladder.best_ask,
            "order book"
        ),
        MarketEvent::Tape { market, trades } => {
            debug!(market = %market, count = trades.len(), "trade tape")
        }
        MarketEvent::MyOrders { market, orders } => {
            info!(market = %market, count = orders.len(), "open orders")
        }
        MarketEvent::MyTrades { market, trades } => {
            info!(market = %market, count = trades.len(), "my trades")
        }
    }
}
