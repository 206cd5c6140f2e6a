//! RAM Slab
//!
//! A fixed-size arena holding key/value records. Records are addressed by the
//! offset the free list returned for them:
//!
//! ```text
//! offset ─▶ ┌─────────┬───────────┬─────┬───────┐
//!           │ key_len │ value_len │ key │ value │
//!           └─────────┴───────────┴─────┴───────┘
//! ```

use std::collections::BTreeSet;

use crate::memory::{FreeList, HEADER_SIZE, TAG_SIZE};

/// Slab identifier, unique within one collection
pub type SlabId = u32;

/// Default slab size (4 MiB)
pub const DEFAULT_SLAB_SIZE: u32 = 4 * 1024 * 1024;

/// Bytes in front of every record
pub const RECORD_HEADER: u32 = 8;

/// One arena of records
#[derive(Debug)]
pub struct RamSlab {
    id: SlabId,
    arena: FreeList,
    live: BTreeSet<u32>,
}

impl RamSlab {
    pub fn new(id: SlabId, size: u32) -> Self {
        Self {
            id,
            arena: FreeList::new(size),
            live: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> SlabId {
        self.id
    }

    /// Arena size in bytes
    pub fn size(&self) -> u32 {
        self.arena.capacity()
    }

    /// Bytes taken by records and their tags
    pub fn used(&self) -> u32 {
        self.size() - HEADER_SIZE - self.arena.remaining_size()
    }

    /// Largest record payload this slab can take right now
    pub fn max_alloc_size(&self) -> u32 {
        self.arena.max_alloc_size()
    }

    /// Largest record payload an empty slab of `size` bytes can take
    pub fn max_record_size(size: u32) -> u32 {
        size.saturating_sub(HEADER_SIZE + TAG_SIZE)
    }

    /// Encoded size of a record
    pub fn record_size(key: &[u8], value: &[u8]) -> Option<u32> {
        let len = RECORD_HEADER as usize + key.len() + value.len();
        u32::try_from(len).ok()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Store a record, returning its offset
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Option<u32> {
        let size = Self::record_size(key, value)?;
        let offset = self.arena.alloc(size)?;

        let key_len = key.len() as u32;
        let value_len = value.len() as u32;
        self.arena.try_write_u32(offset, key_len);
        self.arena.try_write_u32(offset + 4, value_len);
        let body = self
            .arena
            .bytes_mut(offset + RECORD_HEADER, key_len + value_len)?;
        body[..key.len()].copy_from_slice(key);
        body[key.len()..].copy_from_slice(value);

        self.live.insert(offset);
        Some(offset)
    }

    fn lengths(&self, offset: u32) -> Option<(u32, u32)> {
        if !self.live.contains(&offset) {
            return None;
        }
        Some((
            self.arena.try_read_u32(offset)?,
            self.arena.try_read_u32(offset + 4)?,
        ))
    }

    pub fn key_at(&self, offset: u32) -> Option<&[u8]> {
        let (key_len, _) = self.lengths(offset)?;
        self.arena.bytes(offset + RECORD_HEADER, key_len)
    }

    pub fn value_at(&self, offset: u32) -> Option<&[u8]> {
        let (key_len, value_len) = self.lengths(offset)?;
        self.arena
            .bytes(offset + RECORD_HEADER + key_len, value_len)
    }

    /// Whether the record at `offset` holds `key`
    pub fn matches(&self, offset: u32, key: &[u8]) -> bool {
        self.key_at(offset).map_or(false, |stored| stored == key)
    }

    /// Free the record at `offset`
    pub fn remove(&mut self, offset: u32) -> bool {
        if !self.live.remove(&offset) {
            return false;
        }
        self.arena.free(offset)
    }

    /// Live records as `(key, value)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.live
            .iter()
            .filter_map(move |offset| Some((self.key_at(*offset)?, self.value_at(*offset)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read_back() {
        let mut slab = RamSlab::new(1, 1024);
        let offset = slab.insert(b"key", b"value").unwrap();

        assert_eq!(slab.key_at(offset), Some(&b"key"[..]));
        assert_eq!(slab.value_at(offset), Some(&b"value"[..]));
        assert!(slab.matches(offset, b"key"));
        assert!(!slab.matches(offset, b"other"));
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.used(), RECORD_HEADER + 8 + TAG_SIZE);
    }

    #[test]
    fn test_remove_frees_space() {
        let mut slab = RamSlab::new(1, 1024);
        let offset = slab.insert(b"k", &[7u8; 100]).unwrap();
        assert!(slab.used() > 0);

        assert!(slab.remove(offset));
        assert_eq!(slab.used(), 0);
        assert!(!slab.remove(offset));
        assert!(slab.value_at(offset).is_none());
    }

    #[test]
    fn test_full_slab_refuses() {
        let mut slab = RamSlab::new(1, 256);
        assert!(slab.insert(b"k", &[0u8; 300]).is_none());

        let max = RamSlab::max_record_size(256) - RECORD_HEADER - 1;
        assert!(slab.insert(b"k", &vec![0u8; max as usize]).is_some());
        assert!(slab.insert(b"x", b"y").is_none());
    }

    #[test]
    fn test_entries() {
        let mut slab = RamSlab::new(3, 4096);
        slab.insert(b"a", b"1").unwrap();
        slab.insert(b"b", b"22").unwrap();
        let removed = slab.insert(b"c", b"333").unwrap();
        slab.remove(removed);

        let mut entries: Vec<_> = slab
            .entries()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"22".to_vec())]
        );
    }
}
