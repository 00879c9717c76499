use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("realtime protocol error: {0}")]
    Realtime(String),
    #[error("market stream is not running")]
    StreamNotRunning,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("logging setup error: {0}")]
    Logging(String),
}

impl AppError {
    /// Transport-level failures: the request never produced a usable response.
    pub fn is_network(&self) -> bool {
        match self {
            Self::Reqwest(error) => !error.is_decode(),
            Self::WebSocket(_) | Self::Io(_) => true,
            _ => false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        match self {
            Self::Reqwest(error) => error.is_decode(),
            Self::MalformedResponse(_)
            | Self::SimdJson(_)
            | Self::ParseFloat(_)
            | Self::Timestamp(_) => true,
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}
