//! Supervisor
//!
//! Drives the market: registration, periodic rounds, size pushes and
//! shutdown of the fleet.

pub mod service;

pub use service::{Registration, Supervisor, SupervisorConfig};
