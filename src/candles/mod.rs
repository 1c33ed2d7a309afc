//! Candle Aggregator
//!
//! OHLCV series at five resolutions per asset, in quote units and USD.

pub mod aggregator;
pub mod candle;
pub mod change;
pub mod resolution;


pub use aggregator::{CandleAggregator, HeartbeatReport, HeartbeatWorker};
pub use candle::{Candle, CandleKey, CandleMutation};
pub use resolution::{RESOLUTIONS, Resolution};
