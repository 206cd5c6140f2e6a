//! Event Publisher Adapters
//!
//! - [`LoggingEventPublisher`] turns fleet events into structured log records
//! - [`InMemoryEventCollector`] keeps them for inspection in tests

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::FleetEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;
use crate::market::Uid;

/// Logs each event with its fields.
///
/// Membership changes go out at info, unreachable instances at warn.
/// Allocation changes and round summaries repeat every round, so they stay
/// at debug unless `rounds_at_info` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventPublisher {
    rounds_at_info: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log allocation changes and round summaries at info
    pub fn with_rounds_at_info(mut self, enabled: bool) -> Self {
        self.rounds_at_info = enabled;
        self
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: FleetEvent) -> Result<()> {
        match &event {
            FleetEvent::InstanceRegistered {
                uid,
                requested,
                max_size,
                ..
            } => info!(uid, requested, max_size, "Instance joined"),
            FleetEvent::InstanceRemoved { uid, .. } => info!(uid, "Instance left"),
            FleetEvent::InstanceUnreachable { uid, reason, .. } => {
                warn!(uid, %reason, "Instance unreachable")
            }
            FleetEvent::AllocationChanged {
                uid,
                old_size,
                new_size,
                usage,
                ..
            } => {
                if self.rounds_at_info {
                    info!(uid, old_size, new_size, usage, "Allocation moved");
                } else {
                    debug!(uid, old_size, new_size, usage, "Allocation moved");
                }
            }
            FleetEvent::RoundCompleted {
                instances,
                base_sold,
                auctioned,
                redistributed,
                split,
                unmet_demand,
                duration_ms,
                ..
            } => {
                if self.rounds_at_info {
                    info!(
                        instances,
                        base_sold,
                        auctioned,
                        redistributed,
                        split,
                        unmet_demand,
                        duration_ms,
                        "Round completed"
                    );
                } else {
                    debug!(
                        instances,
                        base_sold,
                        auctioned,
                        redistributed,
                        split,
                        unmet_demand,
                        duration_ms,
                        "Round completed"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Keeps every published event in order.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<FleetEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<FleetEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    /// Events concerning one instance
    pub fn events_for(&self, uid: Uid) -> Vec<FleetEvent> {
        self.matching(|e| e.uid() == Some(uid))
    }

    /// Sizes pushed to `uid`, oldest first
    pub fn allocations_of(&self, uid: Uid) -> Vec<u64> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                FleetEvent::AllocationChanged {
                    uid: target,
                    new_size,
                    ..
                } if *target == uid => Some(*new_size),
                _ => None,
            })
            .collect()
    }

    /// Number of completed rounds
    pub fn rounds(&self) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| matches!(e, FleetEvent::RoundCompleted { .. }))
            .count()
    }

    fn matching(&self, keep: impl Fn(&FleetEvent) -> bool) -> Vec<FleetEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: FleetEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::RoundReport;
    use std::time::Duration;

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_event() {
        let publisher = LoggingEventPublisher::new().with_rounds_at_info(true);
        publisher
            .publish_all(vec![
                FleetEvent::instance_registered(1, 1024, 1024),
                FleetEvent::allocation_changed(1, 0, 1024, 12),
                FleetEvent::instance_unreachable(1, "timed out"),
                FleetEvent::instance_removed(1),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters_by_instance() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish_all(vec![
                FleetEvent::instance_registered(1, 1024, 1024),
                FleetEvent::instance_registered(2, 2048, 2048),
                FleetEvent::allocation_changed(1, 0, 512, 0),
                FleetEvent::allocation_changed(2, 0, 1536, 0),
                FleetEvent::allocation_changed(1, 512, 768, 100),
                FleetEvent::instance_removed(2),
                FleetEvent::round_completed(&RoundReport::default(), Duration::from_millis(3)),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 7);
        assert_eq!(collector.events_of_type("InstanceRegistered").len(), 2);
        assert_eq!(collector.events_for(1).len(), 3);
        assert_eq!(collector.events_for(2).len(), 3);
        assert_eq!(collector.allocations_of(1), vec![512, 768]);
        assert_eq!(collector.allocations_of(2), vec![1536]);
        assert_eq!(collector.rounds(), 1);
    }
}
