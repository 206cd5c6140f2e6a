//! Memory Market
//!
//! Periodic redistribution of a fixed memory pool between cache instances.
//!
//! # Components
//!
//! - **History** (`history.rs`): usage ring buffer and trend classification
//! - **Market** (`market.rs`): the four-phase allocation round

pub mod history;
#[allow(clippy::module_inception)]
pub mod market;
mod proptest;

pub use history::{History, Trend, DEFAULT_HISTORY_SIZE};
pub use market::{
    Allocation, CacheStatus, Market, MarketConfig, RoundReport, Uid, DEFAULT_MIN_SLAB_SIZE,
    DEFAULT_MIN_SLOPE, DEFAULT_POOL_SIZE,
};
