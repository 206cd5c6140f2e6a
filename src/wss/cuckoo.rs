//! Cuckoo Filter
//!
//! Approximate membership with per-key size and access counters. Each key maps
//! to a 16-bit tag and two candidate buckets; collisions move existing items
//! to their alternate bucket, up to [`MAX_KICKS`] times, after which the last
//! displaced item is parked in a single victim slot. While the victim slot is
//! used the filter refuses new keys.

use super::table::{Item, Placement, Table, SLOTS_PER_BUCKET};
use crate::hash::key_hash;

/// Bound on the displacement chain of one insertion
pub const MAX_KICKS: usize = 500;

/// Fingerprint width
pub const DEFAULT_TAG_BITS: u32 = 16;

/// Filter full: the victim slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("cuckoo filter is full")]
    NotEnoughSpace,
}

#[derive(Debug, Clone, Copy)]
struct Victim {
    index: usize,
    item: Item,
}

/// Cuckoo filter sized for `max_keys`
#[derive(Debug, Clone)]
pub struct CuckooFilter {
    table: Table,
    victim: Option<Victim>,
    num_items: usize,
    rng: fastrand::Rng,
}

impl CuckooFilter {
    pub fn new(max_keys: usize) -> Self {
        Self::with_rng(max_keys, fastrand::Rng::new())
    }

    /// Deterministic kick order, for tests and reproducible runs
    pub fn with_seed(max_keys: usize, seed: u64) -> Self {
        Self::with_rng(max_keys, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(max_keys: usize, rng: fastrand::Rng) -> Self {
        let wanted = (max_keys / SLOTS_PER_BUCKET).max(1);
        let mut nb_buckets = wanted.next_power_of_two();
        let load = max_keys as f64 / (nb_buckets * SLOTS_PER_BUCKET) as f64;
        if load > 0.96 {
            nb_buckets <<= 1;
        }

        Self {
            table: Table::new(nb_buckets, DEFAULT_TAG_BITS),
            victim: None,
            num_items: 0,
            rng,
        }
    }

    /// Items stored, victim included
    pub fn len(&self) -> usize {
        self.num_items + usize::from(self.victim.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count of the underlying table
    pub fn capacity(&self) -> usize {
        self.table.slots()
    }

    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.capacity() as f64
    }

    pub fn size_in_bytes(&self) -> usize {
        self.table.size_in_bytes() + std::mem::size_of::<Self>()
    }

    /// Whether the overflow slot is occupied
    pub fn has_victim(&self) -> bool {
        self.victim.is_some()
    }

    fn index_and_tag(&self, hash: u64) -> (usize, u32) {
        let index = (hash as u32 as usize) & (self.table.nb_buckets() - 1);
        let mut tag = ((hash >> 32) as u32) & self.table.tag_mask();
        tag += u32::from(tag == 0);
        (index, tag)
    }

    fn alt_index(&self, index: usize, tag: u32) -> usize {
        (index ^ (tag.wrapping_mul(0x5bd1e995) as usize)) & (self.table.nb_buckets() - 1)
    }

    /// Insert a key carrying `size` bytes of value
    pub fn insert_key(&mut self, key: &[u8], size: u32) -> Result<Item, FilterError> {
        if self.victim.is_some() {
            return Err(FilterError::NotEnoughSpace);
        }
        let (index, tag) = self.index_and_tag(key_hash(key));
        let item = Item::new(tag, size);
        self.place(index, item);
        Ok(item)
    }

    fn place(&mut self, mut index: usize, mut item: Item) {
        for count in 0..MAX_KICKS {
            match self.table.insert(index, item, count > 0, &mut self.rng) {
                Placement::Placed => {
                    self.num_items += 1;
                    return;
                }
                Placement::Kicked(evicted) => item = evicted,
                Placement::Full => {}
            }
            index = self.alt_index(index, item.tag);
        }
        self.victim = Some(Victim { index, item });
    }

    /// Look a key up, counting the access
    pub fn find(&mut self, key: &[u8]) -> Option<Item> {
        let (i1, tag) = self.index_and_tag(key_hash(key));
        let i2 = self.alt_index(i1, tag);

        if let Some(victim) = self.victim.as_mut() {
            if victim.item.tag == tag && (victim.index == i1 || victim.index == i2) {
                victim.item.access_count = victim.item.access_count.saturating_add(1);
                return Some(victim.item);
            }
        }

        let item = self.table.find_mut(i1, i2, tag)?;
        item.access_count = item.access_count.saturating_add(1);
        Some(*item)
    }

    /// Membership test without touching the counters
    pub fn contains(&self, key: &[u8]) -> bool {
        let (i1, tag) = self.index_and_tag(key_hash(key));
        let i2 = self.alt_index(i1, tag);
        let in_victim = self
            .victim
            .map(|v| v.item.tag == tag && (v.index == i1 || v.index == i2))
            .unwrap_or(false);
        in_victim || self.table.contains(i1, i2, tag)
    }

    /// Remove a key, returning its item
    pub fn delete(&mut self, key: &[u8]) -> Option<Item> {
        let (i1, tag) = self.index_and_tag(key_hash(key));
        let i2 = self.alt_index(i1, tag);

        let removed = self
            .table
            .delete(i1, tag)
            .or_else(|| self.table.delete(i2, tag));
        if let Some(item) = removed {
            self.num_items -= 1;
            if let Some(victim) = self.victim.take() {
                self.place(victim.index, victim.item);
            }
            return Some(item);
        }

        match self.victim {
            Some(victim) if victim.item.tag == tag && (victim.index == i1 || victim.index == i2) => {
                self.victim = None;
                Some(victim.item)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> Vec<u8> {
        format!("key-{i}").into_bytes()
    }

    #[test]
    fn test_sizing() {
        assert_eq!(CuckooFilter::new(0).capacity(), 4);
        assert_eq!(CuckooFilter::new(100).capacity(), 128);
        // 1024 keys over 256 buckets is a full table, so it doubles
        assert_eq!(CuckooFilter::new(1024).capacity(), 2048);
    }

    #[test]
    fn test_insert_find_delete() {
        let mut filter = CuckooFilter::with_seed(1000, 42);
        let inserted = filter.insert_key(b"alpha", 100).unwrap();
        assert_eq!(inserted.size, 100);
        assert_eq!(filter.len(), 1);

        let found = filter.find(b"alpha").unwrap();
        assert_eq!(found.size, 100);
        assert_eq!(found.access_count, 1);

        let deleted = filter.delete(b"alpha").unwrap();
        assert_eq!(deleted.access_count, 1);
        assert!(filter.find(b"alpha").is_none());
        assert!(filter.is_empty());
    }

    #[test]
    fn test_access_count_accumulates() {
        let mut filter = CuckooFilter::with_seed(100, 1);
        filter.insert_key(b"hot", 8).unwrap();
        for _ in 0..7 {
            filter.find(b"hot");
        }
        assert_eq!(filter.find(b"hot").unwrap().access_count, 8);
        assert!(filter.contains(b"hot"));
        // contains does not count
        assert_eq!(filter.find(b"hot").unwrap().access_count, 9);
    }

    #[test]
    fn test_unrelated_key_not_found() {
        let mut filter = CuckooFilter::with_seed(1000, 3);
        for i in 0..50 {
            filter.insert_key(&key(i), 1).unwrap();
        }
        assert!(filter.find(b"missing-key").is_none());
        assert!(filter.delete(b"missing-key").is_none());
        assert_eq!(filter.len(), 50);
    }

    #[test]
    fn test_overflow_parks_victim_then_refuses() {
        let mut filter = CuckooFilter::with_seed(8, 9);
        let slots = filter.capacity();

        let mut inserted = 0;
        let mut refused = false;
        for i in 0..slots * 4 {
            match filter.insert_key(&key(i), 1) {
                Ok(_) => inserted += 1,
                Err(FilterError::NotEnoughSpace) => {
                    refused = true;
                    break;
                }
            }
        }

        assert!(refused);
        assert!(filter.has_victim());
        assert_eq!(filter.len(), inserted);
        assert!(inserted <= slots + 1);
    }

    #[test]
    fn test_delete_reinserts_victim() {
        let mut filter = CuckooFilter::with_seed(8, 11);
        let mut keys = Vec::new();
        let mut i = 0;
        while !filter.has_victim() {
            filter.insert_key(&key(i), 1).unwrap();
            keys.push(key(i));
            i += 1;
        }
        let before = filter.len();

        let mut deleted = 0;
        for k in &keys {
            if filter.delete(k).is_some() {
                deleted += 1;
            }
            if !filter.has_victim() {
                break;
            }
        }
        assert!(deleted > 0);
        assert!(!filter.has_victim());
        assert_eq!(filter.len(), before - deleted);
        assert!(filter.insert_key(b"fresh", 1).is_ok());
    }
}
