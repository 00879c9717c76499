use crate::error::AppError;
use crate::market::types::{
    ingest_all, OrderBookSnapshot, OrderBookWire, TradeEvent, TradeWire, UserOrder,
    UserOrderWire, UserTrade, UserTradeWire,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use simd_json::OwnedValue;

pub const SUBSCRIBE_MARKET_EVENT: &str = "sub:market";
pub const UNSUBSCRIBE_MARKET_EVENT: &str = "unsub:market";
pub const ORDERBOOK_EVENT: &str = "orderbook";
pub const TRADES_EVENT: &str = "trades";
pub const MY_ORDERS_EVENT: &str = "my:orders";
pub const MY_TRADES_EVENT: &str = "my:trades";

/// Engine.IO `open` payload.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimePush {
    OrderBook(OrderBookSnapshot),
    Trades(Vec<TradeEvent>),
    MyOrders(Vec<UserOrder>),
    MyTrades(Vec<UserTrade>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    /// Events we do not consume decode to `None`.
    Event(Option<RealtimePush>),
    ConnectError(String),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Serialize)]
struct ConnectAuth<'a> {
    token: &'a str,
}

pub fn decode_engine_packet(text: &str) -> Result<EnginePacket, AppError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| AppError::Realtime("empty engine.io packet".to_string()))?;
    let body = chars.as_str();

    match kind {
        '0' => {
            let mut bytes = body.as_bytes().to_vec();
            let handshake = simd_json::serde::from_slice::<Handshake>(bytes.as_mut_slice())?;
            Ok(EnginePacket::Open(handshake))
        }
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(body.to_string())),
        '3' => Ok(EnginePacket::Pong(body.to_string())),
        '4' => Ok(EnginePacket::Message(decode_socket_packet(body)?)),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(AppError::Realtime(format!(
            "unknown engine.io packet type '{other}'"
        ))),
    }
}

/// Strips an optional `/namespace,` prefix and ack id digits.
fn packet_payload(body: &str) -> &str {
    let body = match body.strip_prefix('/') {
        Some(rest) => rest.split_once(',').map(|(_, tail)| tail).unwrap_or(""),
        None => body,
    };
    body.trim_start_matches(|ch: char| ch.is_ascii_digit())
}

fn decode_socket_packet(body: &str) -> Result<SocketPacket, AppError> {
    let mut chars = body.chars();
    let Some(kind) = chars.next() else {
        return Err(AppError::Realtime("empty socket.io packet".to_string()));
    };
    let payload = packet_payload(chars.as_str());

    match kind {
        '0' => Ok(SocketPacket::Connect),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => Ok(SocketPacket::Event(decode_event(payload)?)),
        '4' => Ok(SocketPacket::ConnectError(connect_error_message(payload))),
        _ => Ok(SocketPacket::Other),
    }
}

fn connect_error_message(payload: &str) -> String {
    #[derive(Deserialize)]
    struct ConnectErrorWire {
        message: Option<String>,
    }

    let mut bytes = payload.as_bytes().to_vec();
    simd_json::serde::from_slice::<ConnectErrorWire>(bytes.as_mut_slice())
        .ok()
        .and_then(|wire| wire.message)
        .unwrap_or_else(|| payload.to_string())
}

fn decode_arg<T: DeserializeOwned + Default>(arg: Option<OwnedValue>) -> Result<T, AppError> {
    match arg {
        Some(value) => Ok(simd_json::serde::from_owned_value(value)?),
        None => Ok(T::default()),
    }
}

fn decode_event(payload: &str) -> Result<Option<RealtimePush>, AppError> {
    let mut bytes = payload.as_bytes().to_vec();
    let mut items = simd_json::serde::from_slice::<Vec<OwnedValue>>(bytes.as_mut_slice())?
        .into_iter();
    let name = items
        .next()
        .ok_or_else(|| AppError::Realtime("event without a name".to_string()))?;
    let name: String = simd_json::serde::from_owned_value(name)?;
    let arg = items.next();

    let push = match name.as_str() {
        ORDERBOOK_EVENT => {
            let wire: Option<OrderBookWire> = decode_arg(arg)?;
            RealtimePush::OrderBook(wire.unwrap_or_default().into())
        }
        TRADES_EVENT => {
            let wire: Option<Vec<TradeWire>> = decode_arg(arg)?;
            RealtimePush::Trades(ingest_all(wire.unwrap_or_default(), "pushed trades"))
        }
        MY_ORDERS_EVENT => {
            let wire: Option<Vec<UserOrderWire>> = decode_arg(arg)?;
            RealtimePush::MyOrders(ingest_all(wire.unwrap_or_default(), "pushed orders"))
        }
        MY_TRADES_EVENT => {
            let wire: Option<Vec<UserTradeWire>> = decode_arg(arg)?;
            RealtimePush::MyTrades(ingest_all(wire.unwrap_or_default(), "pushed user trades"))
        }
        _ => return Ok(None),
    };
    Ok(Some(push))
}

pub fn encode_connect(token: Option<&str>) -> Result<String, AppError> {
    match token {
        Some(token) => Ok(format!(
            "40{}",
            simd_json::serde::to_string(&ConnectAuth { token })?
        )),
        None => Ok("40".to_string()),
    }
}

pub fn encode_event(name: &str, arg: &str) -> Result<String, AppError> {
    Ok(format!("42{}", simd_json::serde::to_string(&(name, arg))?))
}

pub fn encode_pong(payload: &str) -> String {
    format!("3{payload}")
}
