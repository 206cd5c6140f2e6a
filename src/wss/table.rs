//! Bucketed Tag Table
//!
//! Fixed array of 4-slot buckets backing the cuckoo filter. A slot whose tag
//! is 0 is empty.

/// Slots per bucket
pub const SLOTS_PER_BUCKET: usize = 4;

/// Fingerprint plus the metadata tracked for one key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Item {
    pub tag: u32,
    pub size: u32,
    pub access_count: u16,
}

impl Item {
    pub fn new(tag: u32, size: u32) -> Self {
        Self {
            tag,
            size,
            access_count: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tag == 0
    }
}

/// Result of placing an item in a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Stored in a free slot
    Placed,
    /// Stored by displacing this item
    Kicked(Item),
    /// Bucket full and kicking not allowed
    Full,
}

/// Table of `nb_buckets` x 4 items
#[derive(Debug, Clone)]
pub struct Table {
    buckets: Vec<[Item; SLOTS_PER_BUCKET]>,
    tag_mask: u32,
}

impl Table {
    /// `nb_buckets` must be a power of two
    pub fn new(nb_buckets: usize, bits_per_tag: u32) -> Self {
        debug_assert!(nb_buckets.is_power_of_two());
        let tag_mask = if bits_per_tag >= 32 {
            u32::MAX
        } else {
            (1u32 << bits_per_tag) - 1
        };
        Self {
            buckets: vec![[Item::default(); SLOTS_PER_BUCKET]; nb_buckets],
            tag_mask,
        }
    }

    pub fn nb_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn tag_mask(&self) -> u32 {
        self.tag_mask
    }

    /// Total slot count
    pub fn slots(&self) -> usize {
        self.buckets.len() * SLOTS_PER_BUCKET
    }

    /// Memory held by the slot array
    pub fn size_in_bytes(&self) -> usize {
        self.buckets.len() * std::mem::size_of::<[Item; SLOTS_PER_BUCKET]>()
    }

    pub fn read(&self, bucket: usize, slot: usize) -> Item {
        self.buckets[bucket][slot]
    }

    /// Locate `tag` in either candidate bucket
    pub fn find_mut(&mut self, i1: usize, i2: usize, tag: u32) -> Option<&mut Item> {
        let (first, second) = if i1 == i2 { (i1, None) } else { (i1, Some(i2)) };
        let in_first = self.buckets[first].iter().position(|it| it.tag == tag);
        match in_first {
            Some(slot) => Some(&mut self.buckets[first][slot]),
            None => {
                let second = second?;
                let slot = self.buckets[second].iter().position(|it| it.tag == tag)?;
                Some(&mut self.buckets[second][slot])
            }
        }
    }

    pub fn contains(&self, i1: usize, i2: usize, tag: u32) -> bool {
        self.buckets[i1].iter().any(|it| it.tag == tag)
            || self.buckets[i2].iter().any(|it| it.tag == tag)
    }

    /// Remove one item carrying `tag` from `bucket`
    pub fn delete(&mut self, bucket: usize, tag: u32) -> Option<Item> {
        let slot = self.buckets[bucket].iter().position(|it| it.tag == tag)?;
        Some(std::mem::take(&mut self.buckets[bucket][slot]))
    }

    /// Store `item` in `bucket`, displacing a random slot when full and
    /// `kickout` is set
    pub fn insert(
        &mut self,
        bucket: usize,
        item: Item,
        kickout: bool,
        rng: &mut fastrand::Rng,
    ) -> Placement {
        let slots = &mut self.buckets[bucket];
        if let Some(free) = slots.iter_mut().find(|it| it.is_empty()) {
            *free = item;
            return Placement::Placed;
        }
        if !kickout {
            return Placement::Full;
        }
        let slot = rng.usize(..SLOTS_PER_BUCKET);
        Placement::Kicked(std::mem::replace(&mut slots[slot], item))
    }

    /// Number of occupied slots in `bucket`
    pub fn occupied(&self, bucket: usize) -> usize {
        self.buckets[bucket].iter().filter(|it| !it.is_empty()).count()
    }
}
