use crate::error::AppError;
use crate::market::config::normalize_market;
use crate::market::types::{
    ingest_all, ApiErrorWire, Candle, CandlesResponseWire, MarketSelection, MarketsResponseWire,
    OrderBookSnapshot, OrderBookWire, Side, TradeEvent, TradesResponseWire, UserOrder,
    UserOrdersResponseWire, UserTrade, UserTradesResponseWire,
};
use crate::session::Session;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Read side of the backend. The reconciler only ever sees this trait, so
/// tests and alternative transports can stand in for the REST client.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_candles(
        &self,
        selection: &MarketSelection,
        limit: u16,
        to: Option<i64>,
    ) -> Result<Vec<Candle>, AppError>;

    async fn fetch_order_book(&self, market: &str, depth: u16)
        -> Result<OrderBookSnapshot, AppError>;

    async fn fetch_trades(&self, market: &str, limit: u16) -> Result<Vec<TradeEvent>, AppError>;

    async fn fetch_markets(&self) -> Result<Vec<String>, AppError>;

    async fn fetch_user_orders(&self, market: &str) -> Result<Vec<UserOrder>, AppError>;

    async fn fetch_user_trades(&self, market: &str, limit: u16)
        -> Result<Vec<UserTrade>, AppError>;
}

/// Write side: forwards user intent, never decides anything itself.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &PlaceOrderRequest) -> Result<(), AppError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderArgs {
    pub market: Option<String>,
    pub side: Option<Side>,
    pub price: Option<f64>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlaceOrderRequest {
    pub market: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
}

impl PlaceOrderArgs {
    pub fn normalize(self) -> Result<PlaceOrderRequest, AppError> {
        let market = normalize_market(self.market.as_deref().unwrap_or_default())?;
        let side = self
            .side
            .ok_or_else(|| AppError::InvalidArgument("side is required".to_string()))?;

        let price = self.price.unwrap_or(0.0);
        let amount = self.amount.unwrap_or(0.0);
        if !price.is_finite() || price <= 0.0 || !amount.is_finite() || amount <= 0.0 {
            return Err(AppError::InvalidArgument(
                "price and amount must be finite and greater than zero".to_string(),
            ));
        }

        Ok(PlaceOrderRequest {
            market,
            side,
            price,
            amount,
        })
    }
}

pub(crate) fn normalize_order_id(order_id: &str) -> Result<&str, AppError> {
    let order_id = order_id.trim();
    let allowed = |ch: char| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_');
    if order_id.is_empty() || !order_id.chars().all(allowed) {
        return Err(AppError::InvalidArgument(
            "order id must be non-empty ASCII alphanumerics, '-' or '_'".to_string(),
        ));
    }
    Ok(order_id)
}

fn candles_endpoint(
    session: &Session,
    selection: &MarketSelection,
    limit: u16,
    to: Option<i64>,
) -> Result<Url, AppError> {
    let mut endpoint = session.endpoint("api/trade/candles")?;
    {
        let mut query = endpoint.query_pairs_mut();
        query
            .append_pair("market", &selection.market)
            .append_pair("interval", selection.timeframe.as_str())
            .append_pair("limit", &limit.to_string());
        if let Some(boundary) = to {
            query.append_pair("to", &boundary.to_string());
        }
    }
    Ok(endpoint)
}

fn order_book_endpoint(session: &Session, market: &str, depth: u16) -> Result<Url, AppError> {
    let mut endpoint = session.endpoint("api/trade/orderbook")?;
    endpoint
        .query_pairs_mut()
        .append_pair("market", market)
        .append_pair("depth", &depth.to_string());
    Ok(endpoint)
}

fn trades_endpoint(session: &Session, market: &str, limit: u16) -> Result<Url, AppError> {
    let mut endpoint = session.endpoint("api/trade/trades")?;
    endpoint
        .query_pairs_mut()
        .append_pair("market", market)
        .append_pair("limit", &limit.to_string());
    Ok(endpoint)
}

fn markets_endpoint(session: &Session) -> Result<Url, AppError> {
    session.endpoint("api/trade/markets")
}

fn user_orders_endpoint(session: &Session, market: &str) -> Result<Url, AppError> {
    let mut endpoint = session.endpoint("api/trade/my/orders")?;
    endpoint
        .query_pairs_mut()
        .append_pair("status", "open")
        .append_pair("market", market);
    Ok(endpoint)
}

fn user_trades_endpoint(session: &Session, market: &str, limit: u16) -> Result<Url, AppError> {
    let mut endpoint = session.endpoint("api/trade/my/trades")?;
    endpoint
        .query_pairs_mut()
        .append_pair("market", market)
        .append_pair("limit", &limit.to_string());
    Ok(endpoint)
}

fn place_order_endpoint(session: &Session) -> Result<Url, AppError> {
    session.endpoint("api/trade/order")
}

fn cancel_order_endpoint(session: &Session, order_id: &str) -> Result<Url, AppError> {
    let order_id = normalize_order_id(order_id)?;
    session.endpoint(&format!("api/trade/cancel/{order_id}"))
}

/// REST client for the exchange backend, authenticated by the session token.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    session: Session,
}

impl BackendClient {
    pub fn new(session: Session) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()?;
        Ok(Self { http, session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session.bearer() {
            Some(bearer) => request.header(AUTHORIZATION, bearer),
            None => request,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: Url) -> Result<T, AppError> {
        let response = self.authorize(self.http.get(endpoint)).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn send_post(&self, request: RequestBuilder) -> Result<(), AppError> {
        let response = self.authorize(request).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<ApiErrorWire>()
        .await
        .ok()
        .and_then(|payload| payload.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(AppError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl MarketDataSource for BackendClient {
    async fn fetch_candles(
        &self,
        selection: &MarketSelection,
        limit: u16,
        to: Option<i64>,
    ) -> Result<Vec<Candle>, AppError> {
        let endpoint = candles_endpoint(&self.session, selection, limit, to)?;
        let payload = self.get_json::<CandlesResponseWire>(endpoint).await?;
        Ok(ingest_all(payload.candles.unwrap_or_default(), "candles"))
    }

    async fn fetch_order_book(
        &self,
        market: &str,
        depth: u16,
    ) -> Result<OrderBookSnapshot, AppError> {
        let endpoint = order_book_endpoint(&self.session, market, depth)?;
        let payload = self.get_json::<Option<OrderBookWire>>(endpoint).await?;
        Ok(payload.unwrap_or_default().into())
    }

    async fn fetch_trades(&self, market: &str, limit: u16) -> Result<Vec<TradeEvent>, AppError> {
        let endpoint = trades_endpoint(&self.session, market, limit)?;
        let payload = self.get_json::<TradesResponseWire>(endpoint).await?;
        Ok(ingest_all(payload.trades.unwrap_or_default(), "trades"))
    }

    async fn fetch_markets(&self) -> Result<Vec<String>, AppError> {
        let endpoint = markets_endpoint(&self.session)?;
        let payload = self.get_json::<MarketsResponseWire>(endpoint).await?;

        let mut markets: Vec<String> = payload
            .markets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|market| normalize_market(&market).ok())
            .collect();
        let mut seen = HashSet::new();
        markets.retain(|market| seen.insert(market.clone()));
        Ok(markets)
    }

    async fn fetch_user_orders(&self, market: &str) -> Result<Vec<UserOrder>, AppError> {
        let endpoint = user_orders_endpoint(&self.session, market)?;
        let payload = self.get_json::<UserOrdersResponseWire>(endpoint).await?;
        Ok(ingest_all(payload.orders.unwrap_or_default(), "user orders"))
    }

    async fn fetch_user_trades(
        &self,
        market: &str,
        limit: u16,
    ) -> Result<Vec<UserTrade>, AppError> {
        let endpoint = user_trades_endpoint(&self.session, market, limit)?;
        let payload = self.get_json::<UserTradesResponseWire>(endpoint).await?;
        Ok(ingest_all(payload.trades.unwrap_or_default(), "user trades"))
    }
}

#[async_trait]
impl OrderGateway for BackendClient {
    async fn place_order(&self, order: &PlaceOrderRequest) -> Result<(), AppError> {
        let endpoint = place_order_endpoint(&self.session)?;
        self.send_post(self.http.post(endpoint).json(order)).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), AppError> {
        let endpoint = cancel_order_endpoint(&self.session, order_id)?;
        self.send_post(self.http.post(endpoint)).await
    }
}
