//! Memory Market
//!
//! Splits a fixed byte pool between registered cache instances once per round.
//!
//! # Round
//!
//! ```text
//! sell base ──▶ auction ──▶ free redistribution ──▶ equal split
//!  (trend)     (wallets)     (unmet demand)          (leftover)
//! ```
//!
//! 1. **Base selling**: every instance gets a guarantee derived from its last
//!    allocation, usage ratio and usage trend, clamped to what it requested.
//!    Unused guarantee is credited to its wallet; a target above the request
//!    becomes a buy order.
//! 2. **Auction**: buy orders are served round-robin in windows, paid from
//!    the wallet.
//! 3. **Free redistribution**: buyers that ran out of credit share the
//!    leftover in proportion to their unmet orders.
//! 4. **Equal split**: whatever is still unsold is spread evenly, so the whole
//!    pool is always allocated.
//!
//! The market never fails: unknown instance ids are ignored and a round with no
//! instances does nothing.

use std::collections::BTreeMap;

use tracing::{debug, instrument, trace};

use super::history::{History, Trend, DEFAULT_HISTORY_SIZE};

/// Instance identifier assigned at registration
pub type Uid = u64;

/// Default pool size (1 GiB)
pub const DEFAULT_POOL_SIZE: u64 = 1024 * 1024 * 1024;

/// Smallest allocation worth handing out (32 MiB)
pub const DEFAULT_MIN_SLAB_SIZE: u64 = 32 * 1024 * 1024;

/// Minimal slope, in bytes per sample, for usage to count as moving
pub const DEFAULT_MIN_SLOPE: f64 = 1024.0 * 0.1;

/// Market configuration
#[derive(Debug, Clone)]
pub struct MarketConfig {
    /// Total bytes shared between instances
    pub pool_size: u64,
    /// Usage ratio above which a rising instance grows
    pub trigger_increment: f64,
    /// Usage ratio below which a falling instance shrinks
    pub trigger_decrement: f64,
    /// Growth factor per round
    pub increasing_speed: f64,
    /// Shrink factor per round
    pub decreasing_speed: f64,
    /// Lower bound of a base allocation
    pub min_slab_size: u64,
    /// Trend threshold in bytes per sample
    pub min_slope: f64,
    /// Bytes a buyer may take per auction turn, `None` splits the pool evenly
    pub window_size: Option<u64>,
    /// Wallet ceiling
    pub max_wallet: u64,
    /// Usage samples kept per instance
    pub history_size: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            trigger_increment: 0.8,
            trigger_decrement: 0.5,
            increasing_speed: 0.1,
            decreasing_speed: 0.1,
            min_slab_size: DEFAULT_MIN_SLAB_SIZE,
            min_slope: DEFAULT_MIN_SLOPE,
            window_size: None,
            max_wallet: DEFAULT_POOL_SIZE,
            history_size: DEFAULT_HISTORY_SIZE,
        }
    }
}

impl MarketConfig {
    /// Default configuration over a pool of `pool_size` bytes
    pub fn with_pool_size(pool_size: u64) -> Self {
        Self {
            pool_size,
            max_wallet: pool_size,
            ..Default::default()
        }
    }
}

/// Per-instance market state
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub uid: Uid,
    /// Declared ceiling
    pub requested: u64,
    /// Current allocation
    pub size: u64,
    /// Allocation before the last round
    pub last: u64,
    /// Allocation without the equal-split top-up
    pub buying_size: u64,
    /// Reported usage samples
    pub usages: History,
    /// Credit saved from unused guarantees
    pub wallet: u64,
}

/// Read-only view of one instance's allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub uid: Uid,
    pub requested: u64,
    pub size: u64,
    pub last: u64,
    pub buying_size: u64,
    pub wallet: u64,
    pub usage: u64,
}

impl From<&CacheStatus> for Allocation {
    fn from(status: &CacheStatus) -> Self {
        Self {
            uid: status.uid,
            requested: status.requested,
            size: status.size,
            last: status.last,
            buying_size: status.buying_size,
            wallet: status.wallet,
            usage: status.usages.current(),
        }
    }
}

/// Bytes moved by each phase of a round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    pub instances: usize,
    pub base_sold: u64,
    pub auctioned: u64,
    pub redistributed: u64,
    pub split: u64,
    /// Sum of orders left unpaid after the auction
    pub unmet_demand: u64,
}

/// The allocation market
#[derive(Debug)]
pub struct Market {
    config: MarketConfig,
    caches: BTreeMap<Uid, CacheStatus>,
}

impl Market {
    /// Create a market with default tuning over `pool_size` bytes
    pub fn new(pool_size: u64) -> Self {
        Self::with_config(MarketConfig::with_pool_size(pool_size))
    }

    pub fn with_config(config: MarketConfig) -> Self {
        Self {
            config,
            caches: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn pool_size(&self) -> u64 {
        self.config.pool_size
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub fn contains(&self, uid: Uid) -> bool {
        self.caches.contains_key(&uid)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register an instance, replacing any previous entry with the same uid
    pub fn register_cache(&mut self, uid: Uid, requested: u64, initial_usage: u64) {
        let mut usages = History::new(self.config.history_size);
        usages.add(initial_usage);

        let replaced = self
            .caches
            .insert(
                uid,
                CacheStatus {
                    uid,
                    requested,
                    size: initial_usage,
                    last: initial_usage,
                    buying_size: initial_usage,
                    usages,
                    wallet: 0,
                },
            )
            .is_some();

        debug!(uid, requested, initial_usage, replaced, "Registered cache");
    }

    /// Forget an instance; unknown ids are ignored
    pub fn remove_cache(&mut self, uid: Uid) -> bool {
        self.caches.remove(&uid).is_some()
    }

    /// Record a usage sample
    pub fn update_usage(&mut self, uid: Uid, usage: u64) {
        if let Some(status) = self.caches.get_mut(&uid) {
            status.usages.add(usage);
        }
    }

    /// Overwrite the allocation with the size the instance actually runs with
    pub fn update_size(&mut self, uid: Uid, size: u64) {
        if let Some(status) = self.caches.get_mut(&uid) {
            status.size = size;
            status.buying_size = size;
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether the last round moved this instance's allocation
    pub fn has_changed(&self, uid: Uid) -> bool {
        self.caches
            .get(&uid)
            .map(|status| status.size != status.last)
            .unwrap_or(false)
    }

    pub fn cache_size(&self, uid: Uid) -> Option<u64> {
        self.caches.get(&uid).map(|status| status.size)
    }

    pub fn buying_size(&self, uid: Uid) -> Option<u64> {
        self.caches.get(&uid).map(|status| status.buying_size)
    }

    pub fn wallet(&self, uid: Uid) -> Option<u64> {
        self.caches.get(&uid).map(|status| status.wallet)
    }

    pub fn status(&self, uid: Uid) -> Option<&CacheStatus> {
        self.caches.get(&uid)
    }

    /// Allocation of every instance, ordered by uid
    pub fn snapshot(&self) -> Vec<Allocation> {
        self.caches.values().map(Allocation::from).collect()
    }

    /// Sum of current allocations
    pub fn allocated(&self) -> u64 {
        self.caches.values().map(|status| status.size).sum()
    }

    // =========================================================================
    // Round
    // =========================================================================

    /// Run one allocation round
    #[instrument(skip(self), fields(instances = self.caches.len()))]
    pub fn run(&mut self) -> RoundReport {
        let mut report = RoundReport {
            instances: self.caches.len(),
            ..Default::default()
        };
        if self.caches.is_empty() {
            return report;
        }

        let mut remaining = self.config.pool_size;
        let mut allocated: BTreeMap<Uid, u64> = BTreeMap::new();
        let mut buyers: BTreeMap<Uid, u64> = BTreeMap::new();

        self.sell_base_memory(&mut remaining, &mut allocated, &mut buyers, &mut report);
        let failed = self.buy_extra_memory(&mut remaining, &mut allocated, buyers, &mut report);
        Self::redistribute(&mut remaining, &mut allocated, &failed, &mut report);
        self.split_equally(remaining, &allocated, &mut report);

        debug!(
            base = report.base_sold,
            auction = report.auctioned,
            redistributed = report.redistributed,
            split = report.split,
            unmet = report.unmet_demand,
            "Market round complete"
        );
        report
    }

    fn sell_base_memory(
        &mut self,
        remaining: &mut u64,
        allocated: &mut BTreeMap<Uid, u64>,
        buyers: &mut BTreeMap<Uid, u64>,
        report: &mut RoundReport,
    ) {
        let cfg = &self.config;
        let pool = cfg.pool_size;

        for (uid, status) in self.caches.iter_mut() {
            let previous = status.buying_size;
            let usage = status.usages.current();
            let usage_ratio = if previous == 0 {
                0.0
            } else {
                usage as f64 / previous as f64
            };
            let trend = status.usages.trend(cfg.min_slope);

            let target = if usage_ratio > cfg.trigger_increment && trend != Trend::Steady {
                scale(previous, 1.0 + cfg.increasing_speed)
            } else if usage_ratio < cfg.trigger_decrement && trend != Trend::Steady {
                scale(previous, 1.0 - cfg.decreasing_speed)
            } else {
                pool.min(usage.saturating_add(scale(pool, 0.01)))
            };

            let floor = cfg.min_slab_size.min(status.requested);
            let base = target.clamp(floor, status.requested).min(*remaining);

            if target > status.requested {
                let order = pool
                    .saturating_sub(status.requested)
                    .min(target - status.requested);
                if order > 0 {
                    buyers.insert(*uid, order);
                }
            } else if target < status.requested {
                status.wallet = status
                    .wallet
                    .saturating_add(status.requested - target)
                    .min(cfg.max_wallet);
            }

            trace!(uid, usage, previous, %trend, target, base, wallet = status.wallet, "Base sale");

            *remaining -= base;
            report.base_sold += base;
            allocated.insert(*uid, base);
        }
    }

    /// Returns the buyers whose orders could not be paid, with what they lack
    fn buy_extra_memory(
        &mut self,
        remaining: &mut u64,
        allocated: &mut BTreeMap<Uid, u64>,
        mut buyers: BTreeMap<Uid, u64>,
        report: &mut RoundReport,
    ) -> BTreeMap<Uid, u64> {
        let mut failed = BTreeMap::new();
        if buyers.is_empty() {
            return failed;
        }

        let window = self
            .config
            .window_size
            .unwrap_or_else(|| (*remaining / buyers.len() as u64).max(1));

        while *remaining > 0 && !buyers.is_empty() {
            let turn: Vec<Uid> = buyers.keys().copied().collect();
            for uid in turn {
                if *remaining == 0 {
                    break;
                }
                let Some(order) = buyers.get(&uid).copied() else {
                    continue;
                };
                let Some(status) = self.caches.get_mut(&uid) else {
                    buyers.remove(&uid);
                    continue;
                };

                let bought = window.min(status.wallet).min(order).min(*remaining);
                if bought == 0 {
                    buyers.remove(&uid);
                    failed.insert(uid, order);
                    report.unmet_demand += order;
                    continue;
                }

                status.wallet -= bought;
                *remaining -= bought;
                report.auctioned += bought;
                *allocated.entry(uid).or_default() += bought;

                if order == bought {
                    buyers.remove(&uid);
                } else {
                    buyers.insert(uid, order - bought);
                }
            }
        }

        failed
    }

    fn redistribute(
        remaining: &mut u64,
        allocated: &mut BTreeMap<Uid, u64>,
        failed: &BTreeMap<Uid, u64>,
        report: &mut RoundReport,
    ) {
        let all_needed = report.unmet_demand;
        if *remaining == 0 || all_needed == 0 {
            return;
        }

        let give = all_needed.min(*remaining);
        for (uid, unmet) in failed {
            let share = (give as u128 * *unmet as u128 / all_needed as u128) as u64;
            *allocated.entry(*uid).or_default() += share;
            *remaining -= share;
            report.redistributed += share;
        }
    }

    fn split_equally(
        &mut self,
        remaining: u64,
        allocated: &BTreeMap<Uid, u64>,
        report: &mut RoundReport,
    ) {
        let count = self.caches.len() as u64;
        let share = remaining / count;
        let extra = remaining % count;

        for (i, (uid, status)) in self.caches.iter_mut().enumerate() {
            let bought = allocated.get(uid).copied().unwrap_or(0);
            let free = share + u64::from((i as u64) < extra);

            status.last = status.size;
            status.buying_size = bought;
            status.size = bought + free;
            report.split += free;
        }
    }
}

fn scale(value: u64, factor: f64) -> u64 {
    (value as f64 * factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_market(pool: u64, min_slab: u64) -> Market {
        Market::with_config(MarketConfig {
            pool_size: pool,
            min_slab_size: min_slab,
            min_slope: 1.0,
            max_wallet: pool,
            ..Default::default()
        })
    }

    fn total(market: &Market) -> u64 {
        market.snapshot().iter().map(|a| a.size).sum()
    }

    #[test]
    fn test_empty_round_is_noop() {
        let mut market = small_market(1000, 10);
        let report = market.run();
        assert_eq!(report, RoundReport::default());
        assert!(market.is_empty());
    }

    #[test]
    fn test_single_instance_gets_whole_pool() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 400, 100);
        market.run();

        assert_eq!(market.cache_size(1), Some(1000));
        // steady: usage + 1% of the pool
        assert_eq!(market.buying_size(1), Some(110));
        assert_eq!(market.wallet(1), Some(290));
    }

    #[test]
    fn test_two_instance_scenario() {
        let mut market = small_market(1000, 32);
        market.register_cache(1, 600, 350);
        market.register_cache(2, 600, 200);
        market.update_size(1, 500);
        market.update_size(2, 500);

        // instance 1 at 90% of its 500 unit allocation and rising
        market.update_usage(1, 400);
        market.update_usage(1, 450);
        // instance 2 flat at 40%
        market.update_usage(2, 200);
        market.update_usage(2, 200);

        let report = market.run();

        let grown = market.buying_size(1).unwrap();
        assert!(grown > 500 && grown <= 600);
        assert_eq!(grown, 550);
        assert_eq!(market.buying_size(2), Some(210));
        assert_eq!(total(&market), 1000);
        assert_eq!(report.split, 240);
        assert_eq!(market.cache_size(1), Some(670));
        assert_eq!(market.cache_size(2), Some(330));
    }

    #[test]
    fn test_wallet_pays_for_auction() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 200, 50);
        market.run();
        assert_eq!(market.wallet(1), Some(140));

        market.update_size(1, 190);
        market.update_usage(1, 150);
        market.update_usage(1, 250);
        let report = market.run();

        assert_eq!(report.auctioned, 9);
        assert_eq!(market.wallet(1), Some(131));
        assert_eq!(market.buying_size(1), Some(209));
        assert_eq!(total(&market), 1000);
    }

    #[test]
    fn test_unpaid_orders_are_redistributed_proportionally() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 100, 100);
        market.register_cache(2, 100, 150);

        let report = market.run();

        assert_eq!(report.unmet_demand, 70);
        assert_eq!(report.redistributed, 70);
        assert_eq!(market.buying_size(1), Some(110));
        assert_eq!(market.buying_size(2), Some(160));
        assert_eq!(market.cache_size(1), Some(475));
        assert_eq!(market.cache_size(2), Some(525));
        assert_eq!(market.wallet(1), Some(0));
    }

    #[test]
    fn test_guarantee_floor_when_shrinking() {
        let mut market = small_market(1000, 200);
        market.register_cache(1, 600, 90);
        market.update_size(1, 100);
        market.update_usage(1, 40);
        market.update_usage(1, 10);

        market.run();
        assert_eq!(market.buying_size(1), Some(200));
    }

    #[test]
    fn test_floor_never_exceeds_request() {
        let mut market = small_market(1000, 500);
        market.register_cache(1, 100, 0);
        market.run();
        assert!(market.buying_size(1).unwrap() <= 100);
    }

    #[test]
    fn test_shrink_on_decreasing_usage() {
        let mut market = small_market(10_000, 10);
        market.register_cache(1, 5000, 3000);
        market.update_size(1, 4000);
        market.update_usage(1, 2000);
        market.update_usage(1, 1000);

        market.run();
        assert_eq!(market.buying_size(1), Some(3600));
    }

    #[test]
    fn test_wallet_is_capped() {
        let mut market = Market::with_config(MarketConfig {
            pool_size: 1000,
            min_slab_size: 10,
            max_wallet: 100,
            ..Default::default()
        });
        market.register_cache(1, 900, 10);
        market.run();
        assert_eq!(market.wallet(1), Some(100));
    }

    #[test]
    fn test_uneven_split_conserves_pool() {
        let mut market = small_market(1001, 1);
        for uid in 0..3 {
            market.register_cache(uid, 100, 50);
        }
        market.run();
        assert_eq!(total(&market), 1001);
    }

    #[test]
    fn test_oversubscribed_requests_conserve_pool() {
        let mut market = small_market(1000, 10);
        for uid in 0..4 {
            market.register_cache(uid, 900, 800);
        }
        market.run();
        assert_eq!(total(&market), 1000);
    }

    #[test]
    fn test_has_changed() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 500, 100);
        assert!(!market.has_changed(1));

        market.run();
        assert!(market.has_changed(1));

        // Same inputs, same allocation
        market.update_size(1, 1000);
        market.run();
        market.run();
        assert!(!market.has_changed(1));
        assert!(!market.has_changed(99));
    }

    #[test]
    fn test_unknown_uids_are_ignored() {
        let mut market = small_market(1000, 10);
        market.update_usage(42, 100);
        market.update_size(42, 100);
        assert!(!market.remove_cache(42));
        assert_eq!(market.cache_size(42), None);
    }

    #[test]
    fn test_reregister_replaces() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 500, 100);
        market.run();
        assert!(market.wallet(1).unwrap() > 0);

        market.register_cache(1, 300, 20);
        let status = market.status(1).unwrap();
        assert_eq!(status.requested, 300);
        assert_eq!(status.wallet, 0);
        assert_eq!(status.size, 20);
        assert_eq!(status.usages.len(), 1);
        assert_eq!(market.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut market = small_market(1000, 10);
        market.register_cache(1, 500, 100);
        assert!(market.remove_cache(1));
        assert!(!market.remove_cache(1));
        assert!(market.is_empty());
    }

    #[test]
    fn test_fixed_window_auction() {
        let mut market = Market::with_config(MarketConfig {
            pool_size: 10_000,
            min_slab_size: 10,
            min_slope: 1.0,
            window_size: Some(1),
            max_wallet: 10_000,
            ..Default::default()
        });
        market.register_cache(1, 200, 50);
        market.run();
        let wallet = market.wallet(1).unwrap();

        market.update_size(1, 190);
        market.update_usage(1, 150);
        market.update_usage(1, 250);
        let report = market.run();

        assert_eq!(report.auctioned, 9);
        assert_eq!(market.wallet(1), Some(wallet - 9));
    }
}
