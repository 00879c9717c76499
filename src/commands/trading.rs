use crate::commands::market_stream::reload_user_feeds;
use crate::error::AppError;
use crate::market::source::{normalize_order_id, PlaceOrderArgs, PlaceOrderRequest};
use crate::state::AppState;
use tracing::info;

fn ensure_signed_in(state: &AppState) -> Result<(), AppError> {
    if state.session.is_authenticated() {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(
            "sign in before trading".to_string(),
        ))
    }
}

pub async fn place_order(
    state: &AppState,
    args: PlaceOrderArgs,
) -> Result<PlaceOrderRequest, AppError> {
    ensure_signed_in(state)?;
    let order = args.normalize()?;
    state.orders.place_order(&order).await?;
    info!(market = %order.market, side = ?order.side, "order placed");

    reload_user_feeds(state).await;
    Ok(order)
}

pub async fn cancel_order(state: &AppState, order_id: &str) -> Result<(), AppError> {
    ensure_signed_in(state)?;
    let order_id = normalize_order_id(order_id)?;
    state.orders.cancel_order(order_id).await?;
    info!(order_id, "order cancelled");

    reload_user_feeds(state).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::source::mock::MockSource;
    use crate::market::types::Side;
    use crate::session::Session;
    use std::sync::Arc;

    fn state_with(source: Arc<MockSource>, signed_in: bool) -> AppState {
        let mut session = Session::new("http://localhost:8080").expect("valid url");
        if signed_in {
            session = session.signed_in("token-1".to_string(), "trader".to_string(), None);
        }
        AppState::with_backend(session, source.clone(), source)
    }

    fn buy_args() -> PlaceOrderArgs {
        PlaceOrderArgs {
            market: Some(" BTC/USDT ".to_string()),
            side: Some(Side::Buy),
            price: Some(64_000.5),
            amount: Some(0.25),
        }
    }

    #[tokio::test]
    async fn guest_cannot_trade() {
        let source = Arc::new(MockSource::default());
        let state = state_with(source.clone(), false);

        assert!(matches!(
            place_order(&state, buy_args()).await,
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            cancel_order(&state, "abc").await,
            Err(AppError::InvalidArgument(_))
        ));
        assert!(source.placed.lock().is_empty());
        assert!(source.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn places_normalized_order_without_running_stream() {
        let source = Arc::new(MockSource::default());
        let state = state_with(source.clone(), true);

        let placed = place_order(&state, buy_args()).await.expect("order placed");
        assert_eq!(placed.market, "BTC/USDT");
        assert_eq!(source.placed.lock().as_slice(), &[placed]);
    }

    #[tokio::test]
    async fn invalid_order_never_reaches_backend() {
        let source = Arc::new(MockSource::default());
        let state = state_with(source.clone(), true);
        let args = PlaceOrderArgs {
            amount: Some(0.0),
            ..buy_args()
        };

        assert!(place_order(&state, args).await.is_err());
        assert!(source.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_trims_and_validates_order_id() {
        let source = Arc::new(MockSource::default());
        let state = state_with(source.clone(), true);

        cancel_order(&state, " ord_42 ").await.expect("cancelled");
        assert!(cancel_order(&state, "../admin").await.is_err());
        assert_eq!(source.cancelled.lock().as_slice(), &["ord_42".to_string()]);
    }
}
