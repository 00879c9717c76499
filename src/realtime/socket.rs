use crate::error::AppError;
use crate::realtime::frame::{
    decode_engine_packet, encode_connect, encode_event, encode_pong, EnginePacket, Handshake,
    RealtimePush, SocketPacket, SUBSCRIBE_MARKET_EVENT, UNSUBSCRIBE_MARKET_EVENT,
};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

type SocketStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything the connection task reports to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeSignal {
    Connected,
    Disconnected { reason: String },
    /// `market` is the market subscribed when the push arrived. Payloads
    /// carry no market of their own, so a frame the server emitted for the
    /// old market before it handled `unsub:market` is credited to the new one.
    Push { market: String, push: RealtimePush },
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub endpoint: Url,
    pub token: Option<String>,
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

pub async fn connect_realtime(endpoint: &Url) -> Result<SocketStream, AppError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) =
        connect_async_with_config(endpoint.as_str(), Some(ws_config), true).await?;
    Ok(stream)
}

/// Keeps one socket.io session alive until `cancel_token` fires, following
/// the market in `market_rx` with sub/unsub events.
pub async fn run_realtime(
    config: RealtimeConfig,
    mut market_rx: watch::Receiver<String>,
    signals: mpsc::Sender<RealtimeSignal>,
    cancel_token: CancellationToken,
) {
    let mut reconnect_attempt = 0_u32;

    while !cancel_token.is_cancelled() {
        let connected = tokio::select! {
            _ = cancel_token.cancelled() => break,
            connected = connect_realtime(&config.endpoint) => connected,
        };

        let reason = match connected {
            Ok(stream) => {
                match run_session(stream, &config, &mut market_rx, &signals, &cancel_token).await
                {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Dropped(reason) => {
                        reconnect_attempt = 0;
                        reason
                    }
                }
            }
            Err(error) => format!("realtime connect error: {error}"),
        };

        warn!(attempt = reconnect_attempt, "{reason}");
        if signals
            .send(RealtimeSignal::Disconnected { reason })
            .await
            .is_err()
        {
            break;
        }

        reconnect_attempt = reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(reconnect_attempt);
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("realtime task stopped");
}

async fn send_text(stream: &mut SocketStream, text: String) -> Result<(), AppError> {
    stream.send(Message::Text(text)).await?;
    Ok(())
}

/// Waits for the Engine.IO open packet, answering pings on the way.
async fn await_handshake(stream: &mut SocketStream) -> Result<Handshake, AppError> {
    let deadline = tokio::time::sleep(Duration::from_millis(HANDSHAKE_TIMEOUT_MS));
    tokio::pin!(deadline);

    loop {
        let message = tokio::select! {
            _ = &mut deadline => {
                return Err(AppError::Realtime("timed out waiting for handshake".to_string()));
            }
            message = stream.next() => message,
        };
        let Some(message) = message else {
            return Err(AppError::Realtime("closed before handshake".to_string()));
        };

        if let Message::Text(text) = message? {
            match decode_engine_packet(&text)? {
                EnginePacket::Open(handshake) => return Ok(handshake),
                EnginePacket::Ping(payload) => send_text(stream, encode_pong(&payload)).await?,
                EnginePacket::Close => {
                    return Err(AppError::Realtime("closed before handshake".to_string()))
                }
                _ => {}
            }
        }
    }
}

async fn run_session(
    mut stream: SocketStream,
    config: &RealtimeConfig,
    market_rx: &mut watch::Receiver<String>,
    signals: &mpsc::Sender<RealtimeSignal>,
    cancel_token: &CancellationToken,
) -> SessionEnd {
    let handshake = match await_handshake(&mut stream).await {
        Ok(handshake) => handshake,
        Err(error) => return SessionEnd::Dropped(format!("realtime handshake failed: {error}")),
    };
    let liveness = Duration::from_millis(
        handshake
            .ping_interval
            .saturating_add(handshake.ping_timeout),
    );

    let connect = match encode_connect(config.token.as_deref()) {
        Ok(packet) => packet,
        Err(error) => return SessionEnd::Dropped(format!("failed to encode connect: {error}")),
    };
    if let Err(error) = send_text(&mut stream, connect).await {
        return SessionEnd::Dropped(format!("failed to send connect: {error}"));
    }

    let ping_deadline = tokio::time::sleep(liveness);
    tokio::pin!(ping_deadline);
    let mut subscribed: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                if let Some(market) = subscribed.take() {
                    if let Ok(packet) = encode_event(UNSUBSCRIBE_MARKET_EVENT, &market) {
                        let _ = send_text(&mut stream, packet).await;
                    }
                }
                let _ = stream.close(None).await;
                return SessionEnd::Cancelled;
            }
            _ = &mut ping_deadline => {
                return SessionEnd::Dropped("realtime ping timeout".to_string());
            }
            changed = market_rx.changed(), if subscribed.is_some() => {
                if changed.is_err() {
                    return SessionEnd::Cancelled;
                }
                let next_market = market_rx.borrow_and_update().clone();
                if let Err(error) = resubscribe(&mut stream, &mut subscribed, next_market).await {
                    return SessionEnd::Dropped(format!("failed to switch subscription: {error}"));
                }
            }
            message = stream.next() => {
                let Some(message) = message else {
                    return SessionEnd::Dropped("realtime stream ended".to_string());
                };
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        return SessionEnd::Dropped("realtime server closed the connection".to_string());
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        return SessionEnd::Dropped(format!("realtime frame error: {error}"));
                    }
                };
                ping_deadline.as_mut().reset(Instant::now() + liveness);

                let packet = match decode_engine_packet(&text) {
                    Ok(packet) => packet,
                    Err(error) => {
                        warn!("dropping realtime packet: {error}");
                        continue;
                    }
                };

                match packet {
                    EnginePacket::Ping(payload) => {
                        if let Err(error) = send_text(&mut stream, encode_pong(&payload)).await {
                            return SessionEnd::Dropped(format!("failed to answer ping: {error}"));
                        }
                    }
                    EnginePacket::Close => {
                        return SessionEnd::Dropped("realtime server closed the session".to_string());
                    }
                    EnginePacket::Message(SocketPacket::Connect) => {
                        let market = market_rx.borrow_and_update().clone();
                        if let Err(error) = resubscribe(&mut stream, &mut subscribed, market).await {
                            return SessionEnd::Dropped(format!("failed to subscribe: {error}"));
                        }
                        info!(market = subscribed.as_deref().unwrap_or_default(), "realtime connected");
                        if signals.send(RealtimeSignal::Connected).await.is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                    EnginePacket::Message(SocketPacket::ConnectError(message)) => {
                        return SessionEnd::Dropped(format!("realtime connect rejected: {message}"));
                    }
                    EnginePacket::Message(SocketPacket::Disconnect) => {
                        return SessionEnd::Dropped("realtime server disconnected".to_string());
                    }
                    EnginePacket::Message(SocketPacket::Event(Some(push))) => {
                        let Some(market) = subscribed.clone() else {
                            continue;
                        };
                        if signals.send(RealtimeSignal::Push { market, push }).await.is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn resubscribe(
    stream: &mut SocketStream,
    subscribed: &mut Option<String>,
    next_market: String,
) -> Result<(), AppError> {
    if subscribed.as_deref() == Some(next_market.as_str()) {
        return Ok(());
    }
    if let Some(previous) = subscribed.take() {
        send_text(stream, encode_event(UNSUBSCRIBE_MARKET_EVENT, &previous)?).await?;
    }
    send_text(stream, encode_event(SUBSCRIBE_MARKET_EVENT, &next_market)?).await?;
    *subscribed = Some(next_market);
    Ok(())
}

pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
