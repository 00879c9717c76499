use crate::error::AppError;
use crate::market::config::DEFAULT_TIMEFRAME;
use crate::market::pipeline::{MarketCommand, MarketEvent, MarketView};
use crate::market::source::{BackendClient, MarketDataSource, OrderGateway};
use crate::market::types::MarketStreamStatusSnapshot;
use crate::session::Session;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 1_024;

pub struct MarketStreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    pub commands: mpsc::Sender<MarketCommand>,
}

pub struct AppState {
    pub session: Session,
    pub source: Arc<dyn MarketDataSource>,
    pub orders: Arc<dyn OrderGateway>,
    pub market_stream: Mutex<Option<MarketStreamHandle>>,
    pub market_status: Arc<RwLock<MarketStreamStatusSnapshot>>,
    pub market_view: Arc<parking_lot::Mutex<MarketView>>,
    pub events: broadcast::Sender<MarketEvent>,
}

impl AppState {
    /// State wired to the REST backend named by `session`.
    pub fn new(session: Session) -> Result<Self, AppError> {
        let client = Arc::new(BackendClient::new(session.clone())?);
        Ok(Self::with_backend(session, client.clone(), client))
    }

    pub fn with_backend(
        session: Session,
        source: Arc<dyn MarketDataSource>,
        orders: Arc<dyn OrderGateway>,
    ) -> Self {
        let market_status = MarketStreamStatusSnapshot::stopped(
            String::new(),
            DEFAULT_TIMEFRAME,
            Some("stream idle".to_string()),
        );
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        Self {
            session,
            source,
            orders,
            market_stream: Mutex::new(None),
            market_status: Arc::new(RwLock::new(market_status)),
            market_view: Arc::new(parking_lot::Mutex::new(MarketView::default())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events.subscribe()
    }
}
