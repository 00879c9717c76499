pub mod market_stream;
pub mod trading;
