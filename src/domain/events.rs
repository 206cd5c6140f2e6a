//! Fleet Events
//!
//! Immutable records of membership and allocation changes, published by the
//! supervisor for audit logging.
//!
//! # Example
//!
//! ```ignore
//! let event = FleetEvent::instance_registered(7, 64 * 1024 * 1024, 64 * 1024 * 1024);
//! event_publisher.publish(event).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::{RoundReport, Uid};

/// Event representing a change in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FleetEvent {
    // =========================================================================
    // Membership Events
    // =========================================================================
    /// An instance joined the market.
    InstanceRegistered {
        uid: Uid,
        requested: u64,
        max_size: u64,
        timestamp: DateTime<Utc>,
    },

    /// An instance left the market.
    InstanceRemoved {
        uid: Uid,
        timestamp: DateTime<Utc>,
    },

    /// An instance failed a request and was dropped.
    InstanceUnreachable {
        uid: Uid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Allocation Events
    // =========================================================================
    /// A round moved an instance's allocation.
    AllocationChanged {
        uid: Uid,
        old_size: u64,
        new_size: u64,
        usage: u64,
        timestamp: DateTime<Utc>,
    },

    /// A market round finished.
    RoundCompleted {
        instances: usize,
        base_sold: u64,
        auctioned: u64,
        redistributed: u64,
        split: u64,
        unmet_demand: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl FleetEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FleetEvent::InstanceRegistered { timestamp, .. } => *timestamp,
            FleetEvent::InstanceRemoved { timestamp, .. } => *timestamp,
            FleetEvent::InstanceUnreachable { timestamp, .. } => *timestamp,
            FleetEvent::AllocationChanged { timestamp, .. } => *timestamp,
            FleetEvent::RoundCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            FleetEvent::InstanceRegistered { .. } => "InstanceRegistered",
            FleetEvent::InstanceRemoved { .. } => "InstanceRemoved",
            FleetEvent::InstanceUnreachable { .. } => "InstanceUnreachable",
            FleetEvent::AllocationChanged { .. } => "AllocationChanged",
            FleetEvent::RoundCompleted { .. } => "RoundCompleted",
        }
    }

    /// Get the instance uid if applicable.
    pub fn uid(&self) -> Option<Uid> {
        match self {
            FleetEvent::InstanceRegistered { uid, .. }
            | FleetEvent::InstanceRemoved { uid, .. }
            | FleetEvent::InstanceUnreachable { uid, .. }
            | FleetEvent::AllocationChanged { uid, .. } => Some(*uid),
            FleetEvent::RoundCompleted { .. } => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl FleetEvent {
    pub fn instance_registered(uid: Uid, requested: u64, max_size: u64) -> Self {
        FleetEvent::InstanceRegistered {
            uid,
            requested,
            max_size,
            timestamp: Utc::now(),
        }
    }

    pub fn instance_removed(uid: Uid) -> Self {
        FleetEvent::InstanceRemoved {
            uid,
            timestamp: Utc::now(),
        }
    }

    pub fn instance_unreachable(uid: Uid, reason: impl Into<String>) -> Self {
        FleetEvent::InstanceUnreachable {
            uid,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn allocation_changed(uid: Uid, old_size: u64, new_size: u64, usage: u64) -> Self {
        FleetEvent::AllocationChanged {
            uid,
            old_size,
            new_size,
            usage,
            timestamp: Utc::now(),
        }
    }

    /// Create a RoundCompleted event from a market report.
    pub fn round_completed(report: &RoundReport, duration: Duration) -> Self {
        FleetEvent::RoundCompleted {
            instances: report.instances,
            base_sold: report.base_sold,
            auctioned: report.auctioned,
            redistributed: report.redistributed,
            split: report.split,
            unmet_demand: report.unmet_demand,
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
