//! Property-Based Tests for the Market
//!
//! # Test Properties
//!
//! 1. **Pool conservation**: after every round the allocations sum to the pool
//! 2. **Guarantee floor**: with the pool covering every request, each
//!    instance buys at least `min(min_slab_size, requested)`
//! 3. **Wallet bounds**: wallets stay within `[0, max_wallet]`
//! 4. **History FIFO**: a ring keeps exactly the newest samples in order

#![cfg(test)]

use proptest::prelude::*;

use super::history::History;
use super::market::{Market, MarketConfig};

// =============================================================================
// Property Strategies
// =============================================================================

/// (requested, initial usage) pairs for up to 8 instances
fn instances_strategy(pool: u64) -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((1..=pool, 0..=pool), 1..8)
}

/// Usage samples fed between rounds
fn usage_rounds_strategy(pool: u64) -> impl Strategy<Value = Vec<Vec<u64>>> {
    prop::collection::vec(prop::collection::vec(0..=pool, 8), 1..6)
}

fn config(pool: u64, min_slab: u64, window: Option<u64>) -> MarketConfig {
    MarketConfig {
        pool_size: pool,
        min_slab_size: min_slab,
        min_slope: 1.0,
        window_size: window,
        max_wallet: pool / 2,
        ..Default::default()
    }
}

// =============================================================================
// Market Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: allocations always add up to the pool, whatever the demand.
    #[test]
    fn prop_pool_conservation(
        pool in 100u64..1_000_000,
        min_slab in 1u64..100,
        window in prop::option::of(1u64..1000),
        instances in instances_strategy(1_000_000),
        rounds in usage_rounds_strategy(1_000_000),
    ) {
        let mut market = Market::with_config(config(pool, min_slab, window));
        for (uid, (requested, usage)) in instances.iter().enumerate() {
            market.register_cache(uid as u64, (*requested).min(pool), (*usage).min(pool));
        }

        for usages in rounds {
            for (uid, usage) in usages.iter().enumerate() {
                market.update_usage(uid as u64, (*usage).min(pool));
            }
            let report = market.run();

            let total: u64 = market.snapshot().iter().map(|a| a.size).sum();
            prop_assert_eq!(total, pool);
            prop_assert_eq!(
                report.base_sold + report.auctioned + report.redistributed + report.split,
                pool
            );
        }
    }

    /// Property: base selling never goes under the floor while the pool
    /// covers every request.
    #[test]
    fn prop_guarantee_floor(
        min_slab in 1u64..2_000,
        requests in prop::collection::vec(1u64..=1_250, 1..8),
        rounds in usage_rounds_strategy(10_000),
    ) {
        let pool = 10_000;
        let mut market = Market::with_config(config(pool, min_slab, None));
        for (uid, requested) in requests.iter().enumerate() {
            market.register_cache(uid as u64, *requested, 0);
        }

        for usages in rounds {
            for (uid, usage) in usages.iter().enumerate() {
                market.update_usage(uid as u64, *usage);
            }
            market.run();
            for (uid, requested) in requests.iter().enumerate() {
                let floor = min_slab.min(*requested);
                prop_assert!(market.buying_size(uid as u64).unwrap() >= floor);
            }
        }
    }

    /// Property: wallets never exceed their cap and buying sizes never
    /// exceed the pool.
    #[test]
    fn prop_wallet_bounds(
        instances in instances_strategy(10_000),
        rounds in usage_rounds_strategy(10_000),
    ) {
        let pool = 10_000;
        let mut market = Market::with_config(config(pool, 10, None));
        for (uid, (requested, usage)) in instances.iter().enumerate() {
            market.register_cache(uid as u64, *requested, *usage);
        }

        for usages in rounds {
            for (uid, usage) in usages.iter().enumerate() {
                market.update_usage(uid as u64, *usage);
            }
            market.run();
            for allocation in market.snapshot() {
                prop_assert!(allocation.wallet <= pool / 2);
                prop_assert!(allocation.buying_size <= allocation.size);
                prop_assert!(allocation.size <= pool);
            }
        }
    }

    /// Property: a history keeps the last `capacity` samples, oldest first.
    #[test]
    fn prop_history_fifo(
        capacity in 1usize..20,
        samples in prop::collection::vec(any::<u64>(), 0..60),
    ) {
        let mut history = History::new(capacity);
        for sample in &samples {
            history.add(*sample);
        }

        let start = samples.len().saturating_sub(capacity);
        prop_assert_eq!(history.iter().collect::<Vec<_>>(), samples[start..].to_vec());
        prop_assert!(history.len() <= capacity);
    }
}
