//! Fleet Metrics
//!
//! Prometheus collectors for the supervisor and the cache instances, held in
//! a registry owned by the process rather than the crate-global default.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::error::Result;
use crate::instance::InstanceStats;
use crate::market::Allocation;
use crate::store::StoreStats;

const NAMESPACE: &str = "cachefleet";

/// All collectors of one process
#[derive(Clone)]
pub struct FleetMetrics {
    registry: Registry,

    // Cache instances
    pub hits: IntCounterVec,
    pub misses: IntCounterVec,
    pub sets: IntCounterVec,
    pub evicted_slabs: IntCounterVec,
    pub promotions: IntCounterVec,
    pub demotions: IntCounterVec,
    pub usage_bytes: IntGaugeVec,
    pub wss_bytes: IntGaugeVec,

    // Supervisor
    pub pool_size: IntGauge,
    pub instances: IntGauge,
    pub allocation_bytes: IntGaugeVec,
    pub rounds: IntCounter,
    pub removed_instances: IntCounter,
    pub round_duration: Histogram,
}

fn counter_vec(name: &str, help: &str, label: &str) -> Result<IntCounterVec> {
    Ok(IntCounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &[label],
    )?)
}

fn gauge_vec(name: &str, help: &str, label: &str) -> Result<IntGaugeVec> {
    Ok(IntGaugeVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        &[label],
    )?)
}

impl FleetMetrics {
    pub fn new() -> Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            hits: counter_vec("cache_hits_total", "Lookups answered", "instance")?,
            misses: counter_vec("cache_misses_total", "Lookups for absent keys", "instance")?,
            sets: counter_vec("cache_sets_total", "Values stored", "instance")?,
            evicted_slabs: counter_vec(
                "cache_evicted_slabs_total",
                "Slabs moved from RAM to disk",
                "instance",
            )?,
            promotions: counter_vec(
                "cache_promotions_total",
                "Values moved from disk back to RAM",
                "instance",
            )?,
            demotions: counter_vec(
                "cache_demotions_total",
                "Values written to disk by slab eviction",
                "instance",
            )?,
            usage_bytes: gauge_vec("cache_usage_bytes", "Bytes used in live slabs", "instance")?,
            wss_bytes: gauge_vec(
                "cache_working_set_bytes",
                "Estimated working set size",
                "instance",
            )?,
            pool_size: IntGauge::with_opts(
                Opts::new("pool_size_bytes", "Memory pool shared by the fleet")
                    .namespace(NAMESPACE),
            )?,
            instances: IntGauge::with_opts(
                Opts::new("instances", "Registered cache instances").namespace(NAMESPACE),
            )?,
            allocation_bytes: gauge_vec(
                "allocation_bytes",
                "Memory allocated to each instance by the last round",
                "uid",
            )?,
            rounds: IntCounter::with_opts(
                Opts::new("market_rounds_total", "Completed market rounds").namespace(NAMESPACE),
            )?,
            removed_instances: IntCounter::with_opts(
                Opts::new(
                    "removed_instances_total",
                    "Instances dropped after a failed request",
                )
                .namespace(NAMESPACE),
            )?,
            round_duration: Histogram::with_opts(
                HistogramOpts::new("round_duration_seconds", "Market round duration")
                    .namespace(NAMESPACE)
                    .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            )?,
        };
        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<()> {
        self.registry.register(Box::new(self.hits.clone()))?;
        self.registry.register(Box::new(self.misses.clone()))?;
        self.registry.register(Box::new(self.sets.clone()))?;
        self.registry.register(Box::new(self.evicted_slabs.clone()))?;
        self.registry.register(Box::new(self.promotions.clone()))?;
        self.registry.register(Box::new(self.demotions.clone()))?;
        self.registry.register(Box::new(self.usage_bytes.clone()))?;
        self.registry.register(Box::new(self.wss_bytes.clone()))?;
        self.registry.register(Box::new(self.pool_size.clone()))?;
        self.registry.register(Box::new(self.instances.clone()))?;
        self.registry.register(Box::new(self.allocation_bytes.clone()))?;
        self.registry.register(Box::new(self.rounds.clone()))?;
        self.registry.register(Box::new(self.removed_instances.clone()))?;
        self.registry.register(Box::new(self.round_duration.clone()))?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one instance tick
    pub fn observe_tick(&self, instance: &str, tick: &InstanceStats, store_delta: &StoreStats) {
        self.hits.with_label_values(&[instance]).inc_by(tick.hits);
        self.misses.with_label_values(&[instance]).inc_by(tick.misses);
        self.sets.with_label_values(&[instance]).inc_by(tick.sets);
        self.evicted_slabs
            .with_label_values(&[instance])
            .inc_by(store_delta.evicted_slabs);
        self.promotions
            .with_label_values(&[instance])
            .inc_by(store_delta.promotions);
        self.demotions
            .with_label_values(&[instance])
            .inc_by(store_delta.demotions);
        self.usage_bytes
            .with_label_values(&[instance])
            .set(clamp_i64(tick.usage));
        self.wss_bytes
            .with_label_values(&[instance])
            .set(clamp_i64(tick.wss));
    }

    /// Record the allocations of a finished round
    pub fn observe_round(&self, allocations: &[Allocation], seconds: f64) {
        self.rounds.inc();
        self.round_duration.observe(seconds);
        self.instances.set(allocations.len() as i64);
        for allocation in allocations {
            self.allocation_bytes
                .with_label_values(&[&allocation.uid.to_string()])
                .set(clamp_i64(allocation.size));
        }
    }

    /// Drop the series of a removed instance
    pub fn forget_instance(&self, uid: u64) {
        let _ = self.allocation_bytes.remove_label_values(&[&uid.to_string()]);
    }

    /// Render the registry in the text exposition format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for FleetMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetMetrics")
            .field("rounds", &self.rounds.get())
            .field("instances", &self.instances.get())
            .finish()
    }
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = FleetMetrics::new().unwrap();
        let b = FleetMetrics::new().unwrap();
        a.rounds.inc();
        assert_eq!(a.rounds.get(), 1);
        assert_eq!(b.rounds.get(), 0);
    }

    #[test]
    fn test_observe_tick() {
        let metrics = FleetMetrics::new().unwrap();
        let tick = InstanceStats {
            hits: 3,
            misses: 1,
            sets: 2,
            usage: 4096,
            size: 8192,
            wss: 1024,
            stale_slabs: 0,
        };
        let delta = StoreStats {
            evicted_slabs: 1,
            ..Default::default()
        };
        metrics.observe_tick("cache-0", &tick, &delta);
        metrics.observe_tick("cache-0", &tick, &StoreStats::default());

        assert_eq!(metrics.hits.with_label_values(&["cache-0"]).get(), 6);
        assert_eq!(metrics.evicted_slabs.with_label_values(&["cache-0"]).get(), 1);
        assert_eq!(metrics.usage_bytes.with_label_values(&["cache-0"]).get(), 4096);
    }

    #[test]
    fn test_encode_contains_namespaced_series() {
        let metrics = FleetMetrics::new().unwrap();
        metrics.pool_size.set(1000);
        metrics.observe_round(
            &[Allocation {
                uid: 7,
                requested: 500,
                size: 500,
                last: 0,
                buying_size: 500,
                wallet: 0,
                usage: 10,
            }],
            0.002,
        );

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("cachefleet_pool_size_bytes 1000"));
        assert!(text.contains("cachefleet_allocation_bytes{uid=\"7\"} 500"));
        assert!(text.contains("cachefleet_market_rounds_total 1"));

        metrics.forget_instance(7);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(!text.contains("uid=\"7\""));
    }
}
