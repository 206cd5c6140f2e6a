//! Cache Instance
//!
//! One hybrid store behind a mutex, plus per-tick counters. The tick loop
//! advances the slab clock, publishes the counters and runs until the
//! instance is stopped or receives a poison pill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::EntityInfo;
use crate::error::{Error, Result};
use crate::metrics::FleetMetrics;
use crate::store::{HybridKVStore, StorageTier, StoreConfig, StoreStats};

/// Instance configuration
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Name used in logs and metric labels
    pub name: String,
    /// Bytes of RAM asked from the supervisor
    pub requested: u64,
    pub tick_interval: Duration,
    pub store: StoreConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: "cache".to_string(),
            requested: 64 * 1024 * 1024,
            tick_interval: Duration::from_secs(1),
            store: StoreConfig::default(),
        }
    }
}

/// Counters of one tick window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    /// Bytes used in live slabs at the end of the window
    pub usage: u64,
    /// RAM allocation at the end of the window
    pub size: u64,
    pub wss: u64,
    /// Slabs that went stale this tick
    pub stale_slabs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    store: HybridKVStore,
    /// Store counters at the previous tick
    reported: StoreStats,
}

/// A running cache instance
#[derive(Debug)]
pub struct CacheInstance {
    config: InstanceConfig,
    inner: Mutex<Inner>,
    counters: Counters,
    last_tick: Mutex<InstanceStats>,
    metrics: Option<Arc<FleetMetrics>>,
    shutdown: CancellationToken,
}

impl CacheInstance {
    /// Open the instance's store
    pub fn open(config: InstanceConfig) -> Result<Self> {
        let store = HybridKVStore::open(config.store.clone())?;
        info!(
            name = %config.name,
            slabs = store.max_slabs(),
            disk = %config.store.disk.path.display(),
            "Opened cache instance"
        );

        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                store,
                reported: StoreStats::default(),
            }),
            counters: Counters::default(),
            last_tick: Mutex::new(InstanceStats::default()),
            metrics: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Report tick counters to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<FleetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    // =========================================================================
    // Client Operations
    // =========================================================================

    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let value = self.inner.lock().store.find(key)?.into_value();
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Store a value; on failure any previous copy of the key is dropped
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<StorageTier> {
        let mut inner = self.inner.lock();
        match inner.store.insert(key, value) {
            Ok(tier) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(tier)
            }
            Err(e) => {
                if let Err(cleanup) = inner.store.remove(key) {
                    warn!(name = %self.config.name, error = %cleanup, "Cleanup after failed set failed");
                }
                Err(e)
            }
        }
    }

    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().store.remove(key)
    }

    // =========================================================================
    // Supervisor Operations
    // =========================================================================

    /// Apply a new RAM allocation; whole slabs only
    #[instrument(skip(self), fields(name = %self.config.name))]
    pub fn resize(&self, bytes: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.store.max_slabs();
        let evicted = inner.store.resize_bytes(bytes)?;
        info!(
            from = before,
            to = inner.store.max_slabs(),
            evicted,
            "Resized RAM tier"
        );
        Ok(())
    }

    pub fn entity_info(&self) -> EntityInfo {
        let inner = self.inner.lock();
        EntityInfo {
            usage: inner.store.memory_usage(),
            size: inner.store.memory_size(),
            wss: inner.store.working_set_size(),
            loaded_slabs: inner.store.loaded_slabs() as u64,
            ram_keys: inner.store.ram_len() as u64,
            disk_keys: inner.store.disk_len() as u64,
        }
    }

    /// Stats of the last completed tick
    pub fn last_tick(&self) -> InstanceStats {
        *self.last_tick.lock()
    }

    pub fn store_stats(&self) -> StoreStats {
        self.inner.lock().store.stats()
    }

    // =========================================================================
    // Tick Loop
    // =========================================================================

    /// Close the current window: mark stale slabs and publish counters
    pub fn tick(&self) -> InstanceStats {
        let (stats, delta) = {
            let mut inner = self.inner.lock();
            let stale_slabs = inner.store.tick() as u64;
            let current = inner.store.stats();
            let delta = StoreStats {
                evicted_slabs: current.evicted_slabs - inner.reported.evicted_slabs,
                promotions: current.promotions - inner.reported.promotions,
                demotions: current.demotions - inner.reported.demotions,
                ..Default::default()
            };
            inner.reported = current;

            let stats = InstanceStats {
                hits: self.counters.hits.swap(0, Ordering::Relaxed),
                misses: self.counters.misses.swap(0, Ordering::Relaxed),
                sets: self.counters.sets.swap(0, Ordering::Relaxed),
                usage: inner.store.memory_usage(),
                size: inner.store.memory_size(),
                wss: inner.store.working_set_size(),
                stale_slabs,
            };
            (stats, delta)
        };

        if let Some(metrics) = &self.metrics {
            metrics.observe_tick(&self.config.name, &stats, &delta);
        }
        debug!(name = %self.config.name, ?stats, "Tick");
        *self.last_tick.lock() = stats;
        stats
    }

    /// Run a store operation on the blocking pool
    ///
    /// Store calls take the instance mutex and may flush the disk log, so async
    /// callers go through here instead of calling them on a runtime worker.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(&CacheInstance) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let instance = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&instance))
            .await
            .map_err(|e| Error::Internal(format!("store task of {} failed: {}", self.config.name, e)))?
    }

    /// Run the tick loop until stopped
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(name = %self.config.name, "Cache instance shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.blocking(|instance| Ok(instance.tick())).await {
                        warn!(name = %self.config.name, error = %e, "Tick failed");
                    }
                }
            }
        }
    }

    /// Stop the tick loop and the client server
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled when the instance stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Hold the store mutex from another thread for `duration`; returns once
    /// the lock is taken
    #[cfg(test)]
    pub(crate) fn stall_store(self: &Arc<Self>, duration: Duration) -> std::thread::JoinHandle<()> {
        let instance = Arc::clone(self);
        let (locked, wait) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _guard = instance.inner.lock();
            let _ = locked.send(());
            std::thread::sleep(duration);
        });
        let _ = wait.recv();
        handle
    }
}
