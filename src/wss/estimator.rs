//! Working-Set-Size Estimator
//!
//! Classifies tracked keys by access count into three buckets and reports how
//! many bytes are actually being re-read.
//!
//! | bucket | accesses | meaning            |
//! |--------|----------|--------------------|
//! | 0      | 0        | written, never read |
//! | 1      | 1..=9    | warm               |
//! | 2      | 10+      | hot                |

use super::cuckoo::{CuckooFilter, FilterError};
use super::table::Item;

/// Access-count thresholds of each bucket
pub const STAGES: [u16; 3] = [0, 1, 10];

/// Aggregate of one access-frequency bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bucket {
    pub count: u64,
    pub total_size: u64,
}

impl Bucket {
    fn add(&mut self, size: u64) {
        self.count += 1;
        self.total_size += size;
    }

    fn sub(&mut self, size: u64) {
        self.count = self.count.saturating_sub(1);
        self.total_size = self.total_size.saturating_sub(size);
    }
}

/// Bounded-memory estimate of the re-used portion of a key space
#[derive(Debug, Clone)]
pub struct WssEstimator {
    filter: CuckooFilter,
    buckets: [Bucket; STAGES.len()],
}

impl WssEstimator {
    /// Estimator able to track about `max_keys` keys
    pub fn new(max_keys: usize) -> Self {
        Self::with_filter(CuckooFilter::new(max_keys))
    }

    pub fn with_filter(filter: CuckooFilter) -> Self {
        Self {
            filter,
            buckets: [Bucket::default(); STAGES.len()],
        }
    }

    /// Bucket an access count falls into
    pub fn bucket_of(access_count: u16) -> usize {
        STAGES
            .iter()
            .rposition(|stage| *stage <= access_count)
            .unwrap_or(0)
    }

    /// Start tracking a freshly written key
    pub fn insert(&mut self, key: &[u8], size: u32) -> Result<Item, FilterError> {
        let item = self.filter.insert_key(key, size)?;
        self.buckets[0].add(size as u64);
        Ok(item)
    }

    /// Count a read of `key`
    pub fn find(&mut self, key: &[u8]) -> Option<Item> {
        let item = self.filter.find(key)?;
        self.update(&item);
        Some(item)
    }

    /// Stop tracking `key`
    pub fn remove(&mut self, key: &[u8]) -> Option<Item> {
        let item = self.filter.delete(key)?;
        self.buckets[Self::bucket_of(item.access_count)].sub(item.size as u64);
        Some(item)
    }

    // Highest stage first so one access crosses at most one threshold.
    fn update(&mut self, item: &Item) {
        for stage in (1..STAGES.len()).rev() {
            if item.access_count > STAGES[stage] {
                break;
            }
            if item.access_count == STAGES[stage] {
                self.buckets[stage - 1].sub(item.size as u64);
                self.buckets[stage].add(item.size as u64);
                break;
            }
        }
    }

    /// Bytes of keys read at least once
    pub fn wss(&self) -> u64 {
        self.buckets[1..].iter().map(|b| b.total_size).sum()
    }

    /// Bytes of every tracked key
    pub fn size(&self) -> u64 {
        self.buckets.iter().map(|b| b.total_size).sum()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Keys currently tracked
    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    /// Memory held by the estimator, independent of value sizes
    pub fn footprint(&self) -> usize {
        self.filter.size_in_bytes()
    }
}
