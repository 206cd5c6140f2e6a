//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! Abstractions the supervisor depends on. Adapters implement them for a
//! concrete transport or sink.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │        InstanceEndpoint │ EventPublisher            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  LocalEndpoint │ LoggingEventPublisher │ Collector  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::FleetEvent;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Snapshot an instance reports to the supervisor each round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    /// Bytes used in live RAM slabs
    pub usage: u64,
    /// Current RAM allocation in bytes
    pub size: u64,
    /// Bytes of values read at least once
    pub wss: u64,
    pub loaded_slabs: u64,
    pub ram_keys: u64,
    pub disk_keys: u64,
}

impl EntityInfo {
    /// Fraction of the allocation in use
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.usage as f64 / self.size as f64
        }
    }
}

// =============================================================================
// Instance Port
// =============================================================================

/// Port for talking to one cache instance.
///
/// The supervisor bounds every call with its request timeout; an error or a
/// timeout marks the instance as dead.
#[async_trait]
pub trait InstanceEndpoint: Send + Sync {
    /// Poll the instance's current usage.
    async fn entity_info(&self) -> Result<EntityInfo>;

    /// Push a new RAM allocation in bytes.
    async fn update_size(&self, bytes: u64) -> Result<()>;

    /// Ask the instance to stop. Best effort, never fails.
    async fn poison_pill(&self);
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing fleet events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: FleetEvent) -> Result<()>;

    /// Publish events in order, stopping at the first failure.
    async fn publish_all(&self, events: Vec<FleetEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let info = EntityInfo {
            usage: 25,
            size: 100,
            ..Default::default()
        };
        assert!((info.utilization() - 0.25).abs() < f64::EPSILON);
        assert_eq!(EntityInfo::default().utilization(), 0.0);
    }

    #[test]
    fn test_entity_info_serialization() {
        let info = EntityInfo {
            usage: 1,
            size: 2,
            wss: 3,
            loaded_slabs: 4,
            ram_keys: 5,
            disk_keys: 6,
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: EntityInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
