//! Supervisor Service
//!
//! Owns the market and the table of registered instances. Each round polls
//! every instance for its usage, runs the market and pushes the allocations
//! that moved. The whole round runs under one lock, so registrations and
//! removals wait for it to finish.
//!
//! An instance that fails or times out on any request is treated as dead:
//! it receives a best-effort poison pill and leaves the market, and the round
//! carries on with the others.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::events::FleetEvent;
use crate::domain::ports::{EventPublisher, InstanceEndpoint};
use crate::error::{Error, Result};
use crate::market::{Allocation, Market, MarketConfig, RoundReport, Uid};
use crate::metrics::FleetMetrics;
use crate::store::DEFAULT_SLAB_SIZE;

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Market parameters; the pool size is rounded up to whole slabs
    pub market: MarketConfig,
    /// Rounds per second
    pub frequency: f64,
    /// Bound on every request to an instance
    pub request_timeout: Duration,
    /// Granularity of instance allocations
    pub slab_size: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            market: MarketConfig::default(),
            frequency: 1.0,
            request_timeout: Duration::from_secs(5),
            slab_size: DEFAULT_SLAB_SIZE as u64,
        }
    }
}

impl SupervisorConfig {
    /// Time between the starts of two rounds
    pub fn round_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency)
    }
}

/// Reply to a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub uid: Uid,
    /// Largest allocation the instance can ever receive
    pub max_size: u64,
}

struct State {
    market: Market,
    members: BTreeMap<Uid, Arc<dyn InstanceEndpoint>>,
}

/// Fleet supervisor
pub struct Supervisor {
    config: SupervisorConfig,
    state: Mutex<State>,
    next_uid: AtomicU64,
    publisher: Arc<dyn EventPublisher>,
    metrics: Option<Arc<FleetMetrics>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("next_uid", &self.next_uid.load(Ordering::Relaxed))
            .finish()
    }
}

impl Supervisor {
    pub fn new(mut config: SupervisorConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        if config.slab_size == 0 {
            return Err(Error::Config("slab size must be positive".to_string()));
        }
        if !(config.frequency.is_finite() && config.frequency > 0.0) {
            return Err(Error::Config(format!(
                "round frequency must be positive, got {}",
                config.frequency
            )));
        }

        let pool = config.market.pool_size.div_ceil(config.slab_size) * config.slab_size;
        if pool != config.market.pool_size {
            info!(
                requested = config.market.pool_size,
                pool, "Rounded memory pool up to whole slabs"
            );
        }
        config.market.pool_size = pool;
        config.market.max_wallet = config.market.max_wallet.min(pool);

        Ok(Self {
            state: Mutex::new(State {
                market: Market::with_config(config.market.clone()),
                members: BTreeMap::new(),
            }),
            config,
            next_uid: AtomicU64::new(1),
            publisher,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<FleetMetrics>) -> Self {
        metrics.pool_size.set(i64::try_from(self.pool_size()).unwrap_or(i64::MAX));
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn pool_size(&self) -> u64 {
        self.config.market.pool_size
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Add an instance asking for `requested` bytes
    ///
    /// The instance starts with no allocation and receives one at the next
    /// round.
    #[instrument(skip(self, endpoint))]
    pub async fn register(
        &self,
        requested: u64,
        endpoint: Arc<dyn InstanceEndpoint>,
    ) -> Result<Registration> {
        if requested == 0 {
            warn!("Rejected registration with an empty request");
            return Err(Error::Config(
                "requested cache size must be positive".to_string(),
            ));
        }
        let max_size = requested.min(self.pool_size());

        let uid = {
            let mut state = self.state.lock().await;
            let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
            state.market.register_cache(uid, max_size, 0);
            state.members.insert(uid, endpoint);
            if let Some(metrics) = &self.metrics {
                metrics.instances.set(state.members.len() as i64);
            }
            uid
        };

        info!(uid, requested, max_size, "Registered instance");
        self.emit(FleetEvent::instance_registered(uid, requested, max_size))
            .await;
        Ok(Registration { uid, max_size })
    }

    /// Remove an instance; returns whether it was registered
    pub async fn remove(&self, uid: Uid) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            state.market.remove_cache(uid);
            let removed = state.members.remove(&uid).is_some();
            if let Some(metrics) = &self.metrics {
                metrics.instances.set(state.members.len() as i64);
                metrics.forget_instance(uid);
            }
            removed
        };

        if removed {
            info!(uid, "Removed instance");
            self.emit(FleetEvent::instance_removed(uid)).await;
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current allocation of an instance
    pub async fn allocation(&self, uid: Uid) -> Option<u64> {
        self.state.lock().await.market.cache_size(uid)
    }

    pub async fn snapshot(&self) -> Vec<Allocation> {
        self.state.lock().await.market.snapshot()
    }

    // =========================================================================
    // Rounds
    // =========================================================================

    async fn request<T>(&self, uid: Uid, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::RemoteUnavailable {
                uid,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::Timeout {
                uid,
                timeout_ms: self.config.request_timeout.as_millis() as u64,
            }),
        }
    }

    async fn drop_dead(&self, state: &mut State, uid: Uid, cause: Error) {
        warn!(uid, error = %cause, "Instance unreachable, removing it");
        if let Some(endpoint) = state.members.remove(&uid) {
            let _ = tokio::time::timeout(self.config.request_timeout, endpoint.poison_pill()).await;
        }
        state.market.remove_cache(uid);

        if let Some(metrics) = &self.metrics {
            metrics.removed_instances.inc();
            metrics.forget_instance(uid);
        }
        self.emit(FleetEvent::instance_unreachable(uid, cause.to_string()))
            .await;
    }

    /// Poll, allocate and push sizes once
    #[instrument(skip(self))]
    pub async fn run_round(&self) -> RoundReport {
        let started = Instant::now();
        let mut state = self.state.lock().await;

        let members: Vec<(Uid, Arc<dyn InstanceEndpoint>)> = state
            .members
            .iter()
            .map(|(uid, endpoint)| (*uid, Arc::clone(endpoint)))
            .collect();

        let polls = join_all(
            members
                .iter()
                .map(|(uid, endpoint)| self.request(*uid, endpoint.entity_info())),
        )
        .await;

        for ((uid, _), poll) in members.iter().zip(polls) {
            match poll {
                Ok(info) => {
                    debug!(uid, usage = info.usage, size = info.size, wss = info.wss, "Polled instance");
                    state.market.update_usage(*uid, info.usage);
                }
                Err(e) => self.drop_dead(&mut state, *uid, e).await,
            }
        }

        let report = state.market.run();

        let changed: Vec<(Uid, Arc<dyn InstanceEndpoint>)> = state
            .members
            .iter()
            .filter(|(uid, _)| state.market.has_changed(**uid))
            .map(|(uid, endpoint)| (*uid, Arc::clone(endpoint)))
            .collect();

        for (uid, endpoint) in changed {
            let Some(status) = state.market.status(uid) else {
                continue;
            };
            let (old_size, new_size, usage) = (status.last, status.size, status.usages.current());

            match self.request(uid, endpoint.update_size(new_size)).await {
                Ok(()) => {
                    debug!(uid, old_size, new_size, "Pushed allocation");
                    self.emit(FleetEvent::allocation_changed(uid, old_size, new_size, usage))
                        .await;
                }
                Err(e) => self.drop_dead(&mut state, uid, e).await,
            }
        }

        let elapsed = started.elapsed();
        if let Some(metrics) = &self.metrics {
            metrics.observe_round(&state.market.snapshot(), elapsed.as_secs_f64());
        }
        drop(state);

        debug!(?report, elapsed_ms = elapsed.as_millis() as u64, "Round completed");
        self.emit(FleetEvent::round_completed(&report, elapsed)).await;
        report
    }

    /// Run rounds at the configured frequency until `shutdown` is cancelled,
    /// then stop every instance
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.round_interval();
        info!(?interval, pool = self.pool_size(), "Starting supervisor");

        loop {
            let started = Instant::now();
            self.run_round().await;

            let pause = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.shutdown().await;
    }

    /// Send a poison pill to every instance and forget them
    pub async fn shutdown(&self) {
        let members = {
            let mut state = self.state.lock().await;
            let members = std::mem::take(&mut state.members);
            for uid in members.keys() {
                state.market.remove_cache(*uid);
            }
            members
        };

        info!(instances = members.len(), "Supervisor shutting down");
        for (uid, endpoint) in members {
            if tokio::time::timeout(self.config.request_timeout, endpoint.poison_pill())
                .await
                .is_err()
            {
                error!(uid, "Poison pill timed out");
            }
        }
    }

    async fn emit(&self, event: FleetEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish fleet event");
        }
    }
}
