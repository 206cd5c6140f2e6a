//! Metrics
//!
//! - [`registry`] - Prometheus collectors of the fleet
//! - [`exporter`] - HTTP endpoints for scraping and probes

pub mod exporter;
pub mod registry;

pub use exporter::{run_health_server, run_metrics_server, HealthState};
pub use registry::FleetMetrics;
