//! cachefleet - Memory-Elastic Key/Value Cache Fleet
//!
//! A fleet of cache instances sharing one fixed memory pool. Each instance
//! keeps a hybrid RAM/disk key/value store; a supervisor periodically
//! redistributes the pool between instances through a market.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────────────────┐
//!                  │          Supervisor           │
//!                  │   poll → Market::run → push   │
//!                  └──────────────┬───────────────┘
//!                                 │ InstanceEndpoint
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!     ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!     │  Instance   │      │  Instance   │      │  Instance   │
//!     │ RAM │ Disk  │      │ RAM │ Disk  │      │ RAM │ Disk  │
//!     └─────────────┘      └─────────────┘      └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Implementations of the domain ports
//! - [`domain`] - Ports and fleet events
//! - [`error`] - Error types
//! - [`hash`] - Key hashing shared by the index and the filter
//! - [`instance`] - Cache instance service and client protocol
//! - [`market`] - Memory market and usage history
//! - [`memory`] - Offset-based free-list allocator
//! - [`metrics`] - Prometheus metrics and HTTP exporter
//! - [`store`] - RAM slabs, disk log and the hybrid store
//! - [`supervisor`] - Round loop and instance table
//! - [`wss`] - Cuckoo filter and working-set estimation

pub mod adapters;
pub mod domain;
pub mod error;
pub mod hash;
pub mod instance;
pub mod market;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod supervisor;
pub mod wss;

// Re-export commonly used types
pub use error::{Error, Result};
pub use instance::{CacheInstance, InstanceConfig};
pub use market::{Market, MarketConfig};
pub use store::{HybridKVStore, Lookup, StorageTier, StoreConfig};
pub use supervisor::{Registration, Supervisor, SupervisorConfig};
pub use wss::{CuckooFilter, WssEstimator};
