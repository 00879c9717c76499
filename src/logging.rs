use crate::error::AppError;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Used when neither an override nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "info,hyper=warn,reqwest=warn,tokio_tungstenite=warn";

pub fn log_filter(filter_override: Option<&str>) -> Result<EnvFilter, AppError> {
    match filter_override {
        Some(filter) => EnvFilter::try_new(filter)
            .map_err(|error| AppError::Logging(format!("invalid log filter {filter:?}: {error}"))),
        None => match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER)
                .map_err(|error| AppError::Logging(error.to_string())),
        },
    }
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_logging(filter_override: Option<&str>) -> Result<(), AppError> {
    let filter = log_filter(filter_override)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|error| AppError::Logging(error.to_string()))
}
