pub mod frame;
pub mod socket;

pub use frame::RealtimePush;
pub use socket::{run_realtime, RealtimeConfig, RealtimeSignal};
