use crate::market::types::{OrderBookLevel, OrderBookSnapshot, TradeEvent};
use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LadderLevel {
    pub price: f64,
    pub amount: f64,
    pub cumulative: f64,
}

/// Display-ready view of one order-book snapshot.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookLadder {
    /// Highest price first; the last row is the best ask.
    pub asks: Vec<LadderLevel>,
    /// Highest price first; the first row is the best bid.
    pub bids: Vec<LadderLevel>,
    pub best_bid: f64,
    pub best_ask: f64,
}

fn by_price_desc(left: &OrderBookLevel, right: &OrderBookLevel) -> Ordering {
    right.price.total_cmp(&left.price)
}

/// Best-first levels with amounts accumulated outward from the spread.
fn accumulate(levels: Vec<&OrderBookLevel>) -> Vec<LadderLevel> {
    let mut cumulative = 0.0;
    levels
        .into_iter()
        .map(|level| {
            cumulative += level.amount.max(0.0);
            LadderLevel {
                price: level.price,
                amount: level.amount,
                cumulative,
            }
        })
        .collect()
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.iter().map(|level| level.price).max_by(f64::total_cmp)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.iter().map(|level| level.price).min_by(f64::total_cmp)
    }

    pub fn ladder(&self, depth: usize) -> OrderBookLadder {
        let mut bids: Vec<&OrderBookLevel> = self.bids.iter().collect();
        bids.sort_by(|left, right| by_price_desc(left, right));
        bids.truncate(depth);

        let mut asks: Vec<&OrderBookLevel> = self.asks.iter().collect();
        asks.sort_by(|left, right| by_price_desc(right, left));
        asks.truncate(depth);
        let mut asks = accumulate(asks);
        asks.reverse();

        OrderBookLadder {
            asks,
            bids: accumulate(bids),
            best_bid: self.best_bid().unwrap_or(0.0),
            best_ask: self.best_ask().unwrap_or(0.0),
        }
    }
}

/// Most recent trade on the tape by `occurred_at`; the first one wins ties.
pub fn last_trade(tape: &[TradeEvent]) -> Option<&TradeEvent> {
    tape.iter().reduce(|latest, candidate| {
        if candidate.occurred_at > latest.occurred_at {
            candidate
        } else {
            latest
        }
    })
}
