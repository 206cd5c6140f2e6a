//! Hybrid Key/Value Store
//!
//! Composes the RAM collection, the disk collection and the working-set
//! estimator. A key lives in exactly one tier at a time:
//!
//! ```text
//!            insert                  find (disk hit)
//! client ─────────────▶ RAM ◀──────────────────────── Disk
//!                        │        promote                ▲
//!                        └───────────────────────────────┘
//!                          demote (whole slab on eviction)
//! ```

use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::disk::{DiskCollection, DiskConfig};
use super::ram::MetaRamCollection;
use super::slab::DEFAULT_SLAB_SIZE;
use crate::error::{Error, Result};
use crate::wss::WssEstimator;

/// Default maximum key size in bytes
pub const DEFAULT_MAX_KEY_SIZE: usize = 512;

/// Default maximum value size in bytes
pub const DEFAULT_MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Slab size in bytes
    pub slab_size: u32,
    /// Initial RAM ceiling in slabs
    pub max_slabs: usize,
    /// Ticks without access before a slab becomes an eviction candidate (0 = never)
    pub slab_ttl: u64,
    pub max_key_size: usize,
    pub max_value_size: usize,
    /// Keys tracked by the working-set estimator
    pub wss_max_keys: usize,
    pub disk: DiskConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            slab_size: DEFAULT_SLAB_SIZE,
            max_slabs: 16,
            slab_ttl: 0,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            wss_max_keys: 1 << 16,
            disk: DiskConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration with the disk tier under `path`
    pub fn with_disk_path(path: impl Into<PathBuf>) -> Self {
        Self {
            disk: DiskConfig::at(path),
            ..Default::default()
        }
    }
}

/// Tier holding a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Ram,
    Disk,
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTier::Ram => write!(f, "RAM"),
            StorageTier::Disk => write!(f, "Disk"),
        }
    }
}

/// Outcome of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Value and the tier it was read from
    Found { value: Bytes, tier: StorageTier },
    NotFound,
}

impl Lookup {
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }
}

/// Store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub ram_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub evicted_slabs: u64,
    /// Records dropped because the disk tier refused them during eviction
    pub dropped: u64,
}

impl StoreStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.ram_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// RAM + disk key/value store
#[derive(Debug)]
pub struct HybridKVStore {
    config: StoreConfig,
    ram: MetaRamCollection,
    disk: DiskCollection,
    wss: WssEstimator,
    stats: StoreStats,
}

impl HybridKVStore {
    /// Open the store; the disk tier is reloaded from its directory
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.slab_size < 64 {
            return Err(Error::Config(format!(
                "slab size {} is too small",
                config.slab_size
            )));
        }
        let ram = MetaRamCollection::new(config.slab_size, config.max_slabs, config.slab_ttl);
        let disk = DiskCollection::open(config.disk.clone())?;
        let wss = WssEstimator::new(config.wss_max_keys);

        Ok(Self {
            config,
            ram,
            disk,
            wss,
            stats: StoreStats::default(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > self.config.max_key_size {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: self.config.max_key_size,
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(Error::ValueTooLarge {
                size: value.len(),
                max: self.config.max_value_size,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Store a value, returning the tier it landed in
    ///
    /// RAM is tried first, then again after evicting one slab when the disk
    /// can take the whole slab; the disk tier takes what RAM refuses.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<StorageTier> {
        self.check_sizes(key, value)?;
        self.remove(key)?;

        let tier = if self.insert_ram(key, value)? {
            StorageTier::Ram
        } else {
            self.disk.insert(key, value)?;
            StorageTier::Disk
        };

        if self.wss.insert(key, value.len() as u32).is_err() {
            debug!("Working-set estimator full, key not tracked");
        }
        self.stats.inserts += 1;
        Ok(tier)
    }

    fn insert_ram(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.ram.insert(key, value) {
            return Ok(true);
        }
        if !self.ram.fits(key, value) || !self.can_demote() {
            return Ok(false);
        }
        Ok(self.evict_one()? && self.ram.insert(key, value))
    }

    /// Whether the disk tier can take every live record of the next victim slab
    fn can_demote(&self) -> bool {
        let bytes = self
            .ram
            .victim_records()
            .into_iter()
            .map(|(key_len, value_len)| DiskCollection::record_len(key_len, value_len))
            .sum();
        self.disk.has_room(bytes)
    }

    /// Read a value; a disk hit is promoted to RAM when room can be made
    /// without losing a demoted record
    pub fn find(&mut self, key: &[u8]) -> Result<Lookup> {
        if let Some(value) = self.ram.find(key) {
            self.wss.find(key);
            self.stats.ram_hits += 1;
            return Ok(Lookup::Found {
                value,
                tier: StorageTier::Ram,
            });
        }

        let Some(value) = self.disk.find(key)? else {
            self.stats.misses += 1;
            return Ok(Lookup::NotFound);
        };
        self.wss.find(key);
        self.stats.disk_hits += 1;

        match self.insert_ram(key, &value) {
            Ok(true) => {
                self.disk.remove(key)?;
                self.stats.promotions += 1;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Promotion failed, value stays on disk"),
        }

        Ok(Lookup::Found {
            value,
            tier: StorageTier::Disk,
        })
    }

    /// Remove a key from both tiers; returns whether it existed
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let in_ram = self.ram.remove(key);
        let on_disk = self.disk.remove(key)?;
        if in_ram || on_disk {
            self.wss.remove(key);
        }
        Ok(in_ram || on_disk)
    }

    /// Tier currently holding `key`, without counting an access
    pub fn tier_of(&self, key: &[u8]) -> Option<StorageTier> {
        if self.ram.contains(key) {
            Some(StorageTier::Ram)
        } else if self.disk.contains(key) {
            Some(StorageTier::Disk)
        } else {
            None
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Evict the least used slab to disk; `false` when RAM holds no slab
    ///
    /// Records the disk budget refuses are dropped. Inserts and promotions
    /// check [`can_demote`](Self::can_demote) first, so only a shrink loses data.
    pub fn evict_one(&mut self) -> Result<bool> {
        let Some(records) = self.ram.evict_one() else {
            return Ok(false);
        };
        self.stats.evicted_slabs += 1;

        for (key, value) in records {
            match self.disk.insert(&key, &value) {
                Ok(()) => self.stats.demotions += 1,
                Err(Error::Capacity { .. }) => {
                    self.wss.remove(&key);
                    self.stats.dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Set the RAM ceiling in slabs, evicting until it is met
    #[instrument(skip(self), fields(loaded = self.ram.loaded_slabs()))]
    pub fn resize(&mut self, slabs: usize) -> Result<usize> {
        self.ram.set_max_slabs(slabs);
        let mut evicted = 0;
        while self.ram.loaded_slabs() > slabs {
            if !self.evict_one()? {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, slabs, "Shrunk RAM tier");
        }
        Ok(evicted)
    }

    /// Set the RAM ceiling in bytes, rounded down to whole slabs
    pub fn resize_bytes(&mut self, bytes: u64) -> Result<usize> {
        let slabs = bytes / self.config.slab_size as u64;
        self.resize(usize::try_from(slabs).unwrap_or(usize::MAX))
    }

    /// Advance the slab clock, returning how many slabs became stale
    pub fn tick(&mut self) -> usize {
        self.ram.tick()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Bytes used in live RAM slabs
    pub fn memory_usage(&self) -> u64 {
        self.ram.memory_usage()
    }

    /// RAM ceiling in bytes
    pub fn memory_size(&self) -> u64 {
        self.ram.memory_size()
    }

    pub fn max_slabs(&self) -> usize {
        self.ram.max_slabs()
    }

    pub fn loaded_slabs(&self) -> usize {
        self.ram.loaded_slabs()
    }

    /// Bytes of values read at least once since insertion
    pub fn working_set_size(&self) -> u64 {
        self.wss.wss()
    }

    /// Bytes of values tracked by the estimator
    pub fn tracked_size(&self) -> u64 {
        self.wss.size()
    }

    pub fn ram_len(&self) -> usize {
        self.ram.len()
    }

    pub fn disk_len(&self) -> usize {
        self.disk.len()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store(dir: &tempfile::TempDir, slab_size: u32, max_slabs: usize) -> HybridKVStore {
        HybridKVStore::open(StoreConfig {
            slab_size,
            max_slabs,
            wss_max_keys: 1024,
            ..StoreConfig::with_disk_path(dir.path())
        })
        .unwrap()
    }

    fn value(fill: u8) -> Vec<u8> {
        vec![fill; 200]
    }

    #[test]
    fn test_insert_and_find_in_ram() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 1024, 2);

        assert_eq!(store.insert(b"k", b"v").unwrap(), StorageTier::Ram);
        assert_eq!(
            store.find(b"k").unwrap(),
            Lookup::Found {
                value: Bytes::from_static(b"v"),
                tier: StorageTier::Ram
            }
        );
        assert_eq!(store.find(b"missing").unwrap(), Lookup::NotFound);
        assert_eq!(store.stats().ram_hits, 1);
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_full_ram_evicts_slab_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 2);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();
        store.find(b"b").unwrap();

        // both slabs full: `a` has fewer hits and is demoted
        assert_eq!(store.insert(b"c", &value(3)).unwrap(), StorageTier::Ram);
        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Disk));
        assert_eq!(store.tier_of(b"b"), Some(StorageTier::Ram));
        assert_eq!(store.tier_of(b"c"), Some(StorageTier::Ram));
        assert_eq!(store.stats().evicted_slabs, 1);
        assert_eq!(store.stats().demotions, 1);
    }

    #[test]
    fn test_disk_hit_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 1);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();
        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Disk));

        let found = store.find(b"a").unwrap();
        assert_matches!(found, Lookup::Found { tier: StorageTier::Disk, .. });
        assert_eq!(found.into_value().unwrap(), Bytes::from(value(1)));

        // `a` moved back, `b` was pushed out to make room
        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Ram));
        assert_eq!(store.tier_of(b"b"), Some(StorageTier::Disk));
        assert_eq!(store.stats().promotions, 1);
    }

    fn budgeted(dir: &tempfile::TempDir, max_bytes: u64) -> HybridKVStore {
        HybridKVStore::open(StoreConfig {
            slab_size: 256,
            max_slabs: 1,
            wss_max_keys: 1024,
            disk: DiskConfig {
                max_bytes,
                ..DiskConfig::at(dir.path())
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_promotion_never_drops_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = budgeted(&dir, 300);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();
        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Disk));

        // demoting `b` would overflow the disk budget: `a` is served from disk
        let found = store.find(b"a").unwrap();
        assert_eq!(found.into_value(), Some(Bytes::from(value(1))));
        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Disk));
        assert_eq!(store.tier_of(b"b"), Some(StorageTier::Ram));
        assert_eq!(store.stats().dropped, 0);
        assert_eq!(store.stats().promotions, 0);
        assert_eq!(store.disk_len(), 1);
    }

    #[test]
    fn test_insert_with_full_disk_keeps_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = budgeted(&dir, 300);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();
        assert_matches!(store.insert(b"c", &value(3)), Err(Error::Capacity { .. }));

        assert_eq!(store.tier_of(b"a"), Some(StorageTier::Disk));
        assert_eq!(store.tier_of(b"b"), Some(StorageTier::Ram));
        assert_eq!(store.tier_of(b"c"), None);
        assert_eq!(store.stats().dropped, 0);
    }

    #[test]
    fn test_without_ram_everything_goes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 0);

        assert_eq!(store.insert(b"k", b"v").unwrap(), StorageTier::Disk);
        let found = store.find(b"k").unwrap();
        assert_matches!(found, Lookup::Found { tier: StorageTier::Disk, .. });
        assert_eq!(store.tier_of(b"k"), Some(StorageTier::Disk));
        assert_eq!(store.stats().promotions, 0);
    }

    #[test]
    fn test_key_in_exactly_one_tier() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 1);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();
        // overwrite the demoted key: the disk copy must go
        store.insert(b"a", &value(9)).unwrap();

        assert_eq!(store.ram_len() + store.disk_len(), 2);
        assert_eq!(store.find(b"a").unwrap().into_value(), Some(Bytes::from(value(9))));
    }

    #[test]
    fn test_remove_from_both_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 1);

        store.insert(b"a", &value(1)).unwrap();
        store.insert(b"b", &value(2)).unwrap();

        assert!(store.remove(b"a").unwrap());
        assert!(store.remove(b"b").unwrap());
        assert!(!store.remove(b"a").unwrap());
        assert_eq!(store.tier_of(b"a"), None);
        assert_eq!(store.ram_len() + store.disk_len(), 0);
    }

    #[test]
    fn test_resize_shrink_demotes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 4);
        for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
            store.insert(*key, &value(i as u8)).unwrap();
        }
        assert_eq!(store.loaded_slabs(), 4);

        assert_eq!(store.resize(1).unwrap(), 3);
        assert_eq!(store.loaded_slabs(), 1);
        assert_eq!(store.ram_len(), 1);
        assert_eq!(store.disk_len(), 3);

        for key in [b"a", b"b", b"c", b"d"] {
            assert!(store.find(key).unwrap().is_found());
        }
    }

    #[test]
    fn test_resize_bytes_rounds_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 1);
        store.resize_bytes(1000).unwrap();
        assert_eq!(store.max_slabs(), 3);
        assert_eq!(store.memory_size(), 768);
    }

    #[test]
    fn test_size_limits() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 1024, 1);
        let key = vec![b'k'; DEFAULT_MAX_KEY_SIZE + 1];
        assert_matches!(store.insert(&key, b"v"), Err(Error::KeyTooLarge { .. }));
    }

    #[test]
    fn test_oversized_record_lands_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 256, 2);
        store.insert(b"small", b"v").unwrap();

        assert_eq!(store.insert(b"big", &[0u8; 400]).unwrap(), StorageTier::Disk);
        // nothing was evicted for a record no slab can hold
        assert_eq!(store.tier_of(b"small"), Some(StorageTier::Ram));
        assert_eq!(store.stats().evicted_slabs, 0);
    }

    #[test]
    fn test_working_set_tracks_reads() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(&dir, 1024, 2);
        store.insert(b"read", &[0u8; 50]).unwrap();
        store.insert(b"unread", &[0u8; 30]).unwrap();
        assert_eq!(store.working_set_size(), 0);

        store.find(b"read").unwrap();
        assert_eq!(store.working_set_size(), 50);
        assert_eq!(store.tracked_size(), 80);

        store.remove(b"read").unwrap();
        assert_eq!(store.working_set_size(), 0);
    }

    #[test]
    fn test_disk_contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store(&dir, 256, 0);
            store.insert(b"persisted", b"yes").unwrap();
        }
        let mut store = store(&dir, 256, 1);
        assert_eq!(
            store.find(b"persisted").unwrap().into_value(),
            Some(Bytes::from_static(b"yes"))
        );
    }
}
