//! Domain Layer
//!
//! # Architecture
//!
//! - **Ports** (`ports.rs`) - Trait abstractions over instances and event sinks
//! - **Events** (`events.rs`) - Fleet events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use cachefleet::domain::ports::InstanceEndpoint;
//!
//! async fn poll<E: InstanceEndpoint>(endpoint: &E) -> Result<u64> {
//!     Ok(endpoint.entity_info().await?.usage)
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::FleetEvent;
pub use ports::{EntityInfo, EventPublisher, InstanceEndpoint};
