pub mod backfill;
pub mod book;
pub mod candles;
pub mod config;
pub mod pipeline;
pub mod reconciler;
pub mod source;
pub mod types;
