//! RAM Collection
//!
//! Set of slabs under a slab-count ceiling, with a secondary index from key
//! hash to record locations and per-slab usage information for eviction.
//!
//! Eviction works on whole slabs: a slab marked as stale by [`tick`] goes
//! first, otherwise the slab with the fewest hits (oldest touch breaking ties).
//!
//! [`tick`]: MetaRamCollection::tick

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use tracing::debug;

use super::slab::{RamSlab, SlabId};
use crate::hash::key_hash;

/// Access bookkeeping of one slab
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabUsage {
    pub hits: u64,
    pub last_touch: u64,
    pub marked_for_eviction: bool,
}

/// Record drained from an evicted slab
pub type Evicted = (Bytes, Bytes);

/// Slab-indexed in-memory key/value collection
#[derive(Debug)]
pub struct MetaRamCollection {
    slab_size: u32,
    max_slabs: usize,
    slab_ttl: u64,
    current_time: u64,
    next_id: SlabId,
    loaded: BTreeMap<SlabId, RamSlab>,
    key_index: HashMap<u64, BTreeMap<SlabId, Vec<u32>>>,
    usage: BTreeMap<SlabId, SlabUsage>,
}

impl MetaRamCollection {
    /// `slab_ttl` is in ticks; 0 never marks slabs as stale
    pub fn new(slab_size: u32, max_slabs: usize, slab_ttl: u64) -> Self {
        Self {
            slab_size,
            max_slabs,
            slab_ttl,
            current_time: 0,
            next_id: 0,
            loaded: BTreeMap::new(),
            key_index: HashMap::new(),
            usage: BTreeMap::new(),
        }
    }

    pub fn slab_size(&self) -> u32 {
        self.slab_size
    }

    pub fn max_slabs(&self) -> usize {
        self.max_slabs
    }

    /// Change the ceiling; callers evict until [`loaded_slabs`] fits
    ///
    /// [`loaded_slabs`]: MetaRamCollection::loaded_slabs
    pub fn set_max_slabs(&mut self, max_slabs: usize) {
        self.max_slabs = max_slabs;
    }

    pub fn loaded_slabs(&self) -> usize {
        self.loaded.len()
    }

    /// Number of keys held
    pub fn len(&self) -> usize {
        self.loaded.values().map(RamSlab::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.values().all(RamSlab::is_empty)
    }

    /// Bytes used by records in slabs not marked for eviction
    pub fn memory_usage(&self) -> u64 {
        self.loaded
            .iter()
            .filter(|(id, _)| !self.usage.get(*id).map_or(false, |u| u.marked_for_eviction))
            .map(|(_, slab)| slab.used() as u64)
            .sum()
    }

    /// Byte ceiling implied by the slab ceiling
    pub fn memory_size(&self) -> u64 {
        self.max_slabs as u64 * self.slab_size as u64
    }

    /// Whether a record for this key/value could ever fit a slab
    pub fn fits(&self, key: &[u8], value: &[u8]) -> bool {
        RamSlab::record_size(key, value)
            .map_or(false, |size| size <= RamSlab::max_record_size(self.slab_size))
    }

    pub fn usage(&self, id: SlabId) -> Option<&SlabUsage> {
        self.usage.get(&id)
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Store a record in the first slab with room, opening a new slab if the
    /// ceiling allows
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let Some(needed) = RamSlab::record_size(key, value) else {
            return false;
        };
        let hash = key_hash(key);

        let placed = self
            .loaded
            .iter_mut()
            .filter(|(_, slab)| slab.max_alloc_size() >= needed)
            .find_map(|(id, slab)| slab.insert(key, value).map(|offset| (*id, offset)));

        let (id, offset) = match placed {
            Some(found) => found,
            None => {
                if self.loaded.len() >= self.max_slabs || !self.fits(key, value) {
                    return false;
                }
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                let mut slab = RamSlab::new(id, self.slab_size);
                let Some(offset) = slab.insert(key, value) else {
                    return false;
                };
                debug!(slab = id, loaded = self.loaded.len() + 1, max = self.max_slabs, "Opened slab");
                self.loaded.insert(id, slab);
                self.usage.insert(
                    id,
                    SlabUsage {
                        last_touch: self.current_time,
                        ..Default::default()
                    },
                );
                (id, offset)
            }
        };

        self.key_index
            .entry(hash)
            .or_default()
            .entry(id)
            .or_default()
            .push(offset);
        if let Some(usage) = self.usage.get_mut(&id) {
            usage.last_touch = self.current_time;
            usage.marked_for_eviction = false;
        }
        true
    }

    fn locate(&self, key: &[u8]) -> Option<(SlabId, u32)> {
        let slots = self.key_index.get(&key_hash(key))?;
        slots.iter().find_map(|(id, offsets)| {
            let slab = self.loaded.get(id)?;
            offsets
                .iter()
                .find(|offset| slab.matches(**offset, key))
                .map(|offset| (*id, *offset))
        })
    }

    /// Read a value, counting a hit on its slab
    pub fn find(&mut self, key: &[u8]) -> Option<Bytes> {
        let (id, offset) = self.locate(key)?;
        let value = Bytes::copy_from_slice(self.loaded.get(&id)?.value_at(offset)?);

        if let Some(usage) = self.usage.get_mut(&id) {
            usage.hits += 1;
            usage.last_touch = self.current_time;
            usage.marked_for_eviction = false;
        }
        Some(value)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.locate(key).is_some()
    }

    /// Drop a key; returns whether it was present
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let Some((id, offset)) = self.locate(key) else {
            return false;
        };
        if let Some(slab) = self.loaded.get_mut(&id) {
            slab.remove(offset);
        }
        self.unindex(key_hash(key), id, offset);
        true
    }

    fn unindex(&mut self, hash: u64, id: SlabId, offset: u32) {
        let Some(slots) = self.key_index.get_mut(&hash) else {
            return;
        };
        if let Some(offsets) = slots.get_mut(&id) {
            offsets.retain(|o| *o != offset);
            if offsets.is_empty() {
                slots.remove(&id);
            }
        }
        if slots.is_empty() {
            self.key_index.remove(&hash);
        }
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Advance the logical clock and mark slabs idle for longer than the TTL
    pub fn tick(&mut self) -> usize {
        self.current_time += 1;
        if self.slab_ttl == 0 {
            return 0;
        }

        let mut marked = 0;
        for usage in self.usage.values_mut() {
            if !usage.marked_for_eviction
                && self.current_time.saturating_sub(usage.last_touch) > self.slab_ttl
            {
                usage.marked_for_eviction = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn current_time(&self) -> u64 {
        self.current_time
    }

    /// Slab that should leave RAM next
    pub fn less_used(&self) -> Option<SlabId> {
        if let Some((id, _)) = self.usage.iter().find(|(_, u)| u.marked_for_eviction) {
            return Some(*id);
        }
        self.usage
            .iter()
            .min_by_key(|(id, u)| (u.hits, u.last_touch, **id))
            .map(|(id, _)| *id)
    }

    /// Live records of the slab [`evict_one`] would pick, as `(key_len, value_len)`
    ///
    /// [`evict_one`]: MetaRamCollection::evict_one
    pub fn victim_records(&self) -> Vec<(usize, usize)> {
        self.less_used()
            .and_then(|id| self.loaded.get(&id))
            .map(|slab| slab.entries().map(|(k, v)| (k.len(), v.len())).collect())
            .unwrap_or_default()
    }

    /// Evict the least used slab, returning its live records
    pub fn evict_one(&mut self) -> Option<Vec<Evicted>> {
        let id = self.less_used()?;
        self.evict_slab(id)
    }

    /// Remove a slab and return its live records
    pub fn evict_slab(&mut self, id: SlabId) -> Option<Vec<Evicted>> {
        let slab = self.loaded.remove(&id)?;
        self.usage.remove(&id);

        let records: Vec<Evicted> = slab
            .entries()
            .map(|(key, value)| (Bytes::copy_from_slice(key), Bytes::copy_from_slice(value)))
            .collect();

        for (key, _) in &records {
            let hash = key_hash(key);
            if let Some(slots) = self.key_index.get_mut(&hash) {
                slots.remove(&id);
                if slots.is_empty() {
                    self.key_index.remove(&hash);
                }
            }
        }

        debug!(slab = id, records = records.len(), "Evicted slab");
        Some(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(len: usize) -> Vec<u8> {
        vec![0xab; len]
    }

    #[test]
    fn test_insert_find_remove() {
        let mut ram = MetaRamCollection::new(1024, 2, 0);
        assert!(ram.insert(b"a", b"1"));
        assert_eq!(ram.find(b"a"), Some(Bytes::from_static(b"1")));
        assert!(ram.contains(b"a"));
        assert_eq!(ram.len(), 1);

        assert!(ram.remove(b"a"));
        assert!(!ram.remove(b"a"));
        assert_eq!(ram.find(b"a"), None);
        assert_eq!(ram.memory_usage(), 0);
    }

    #[test]
    fn test_opens_slabs_up_to_ceiling() {
        let mut ram = MetaRamCollection::new(256, 2, 0);
        assert!(ram.insert(b"a", &value(200)));
        assert!(ram.insert(b"b", &value(200)));
        assert_eq!(ram.loaded_slabs(), 2);
        assert!(!ram.insert(b"c", &value(200)));
        assert_eq!(ram.memory_size(), 512);
    }

    #[test]
    fn test_record_larger_than_slab_refused() {
        let mut ram = MetaRamCollection::new(256, 4, 0);
        assert!(!ram.fits(b"k", &value(300)));
        assert!(!ram.insert(b"k", &value(300)));
        assert_eq!(ram.loaded_slabs(), 0);
    }

    #[test]
    fn test_less_used_prefers_fewest_hits() {
        let mut ram = MetaRamCollection::new(256, 3, 0);
        ram.insert(b"a", &value(200));
        ram.insert(b"b", &value(200));
        ram.insert(b"c", &value(200));

        ram.find(b"a");
        ram.find(b"a");
        ram.find(b"c");

        assert_eq!(ram.less_used(), Some(1));
    }

    #[test]
    fn test_marked_slab_goes_first() {
        let mut ram = MetaRamCollection::new(256, 2, 2);
        ram.insert(b"old", &value(200));
        ram.find(b"old");
        ram.tick();
        ram.tick();
        ram.insert(b"new", &value(200));
        assert_eq!(ram.tick(), 1);

        let usage = ram.usage(0).unwrap();
        assert!(usage.marked_for_eviction);
        assert_eq!(ram.less_used(), Some(0));
        // marked slabs do not count as used memory
        assert_eq!(ram.memory_usage(), ram.loaded.get(&1).unwrap().used() as u64);
    }

    #[test]
    fn test_read_unmarks_slab() {
        let mut ram = MetaRamCollection::new(256, 1, 1);
        ram.insert(b"k", b"v");
        ram.tick();
        ram.tick();
        assert!(ram.usage(0).unwrap().marked_for_eviction);

        ram.find(b"k");
        assert!(!ram.usage(0).unwrap().marked_for_eviction);
    }

    #[test]
    fn test_evict_returns_live_records() {
        let mut ram = MetaRamCollection::new(1024, 2, 0);
        ram.insert(b"a", b"1");
        ram.insert(b"b", b"2");

        let mut records = ram.evict_one().unwrap();
        records.sort();
        assert_eq!(
            records,
            vec![
                (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
                (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
            ]
        );
        assert_eq!(ram.loaded_slabs(), 0);
        assert!(!ram.contains(b"a"));
        assert!(ram.evict_one().is_none());
    }

    #[test]
    fn test_reuses_freed_space() {
        let mut ram = MetaRamCollection::new(256, 1, 0);
        assert!(ram.insert(b"a", &value(200)));
        assert!(!ram.insert(b"b", &value(200)));
        ram.remove(b"a");
        assert!(ram.insert(b"b", &value(200)));
        assert_eq!(ram.loaded_slabs(), 1);
    }
}
