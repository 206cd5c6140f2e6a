//! Free-List Arena Allocator
//!
//! A best-fit allocator working entirely with `u32` offsets inside one flat byte
//! buffer, so the arena can be moved, persisted or mapped without fixing up
//! pointers.
//!
//! # Layout
//!
//! ```text
//! 0        8                                                     capacity
//! ├────────┼──────────┬────────────────┬──────────┬──────────────┤
//! │ header │ tag|data │ node{size,next}│ tag|data │ node ...     │
//! └────────┴──────────┴────────────────┴──────────┴──────────────┘
//! ```
//!
//! - The header stores `{total_size, head}`.
//! - Free nodes form a singly linked list sorted by offset, which lets `free`
//!   detect and merge neighbours.
//! - Every allocated block starts with a 4-byte size tag holding the full
//!   block size.
//!
//! Offset 0 is the header, so it never names a block and doubles as the list
//! terminator.

/// Size of the arena header (`total_size`, `head`)
pub const HEADER_SIZE: u32 = 8;

/// Size of a free node (`size`, `next`), also the smallest block handed out
pub const NODE_SIZE: u32 = 8;

/// Size of the tag written in front of every allocated block
pub const TAG_SIZE: u32 = 4;

const NIL: u32 = 0;

/// Offset-based best-fit allocator over an owned arena
#[derive(Clone)]
pub struct FreeList {
    arena: Box<[u8]>,
}

impl FreeList {
    /// Create an arena of `capacity` bytes with a single free node
    ///
    /// Capacities too small to hold the header and one node are rounded up.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(HEADER_SIZE + NODE_SIZE);
        let mut list = Self {
            arena: vec![0u8; capacity as usize].into_boxed_slice(),
        };
        list.init();
        list
    }

    /// Rebuild an allocator over an arena previously obtained with [`into_arena`]
    ///
    /// Returns `None` when the header does not describe this buffer.
    ///
    /// [`into_arena`]: FreeList::into_arena
    pub fn from_arena(arena: Box<[u8]>) -> Option<Self> {
        if arena.len() < (HEADER_SIZE + NODE_SIZE) as usize || arena.len() > u32::MAX as usize {
            return None;
        }
        let list = Self { arena };
        if list.read_u32(0) as usize != list.arena.len() {
            return None;
        }
        let head = list.head();
        if head != NIL && (head < HEADER_SIZE || head >= list.capacity()) {
            return None;
        }
        Some(list)
    }

    /// Give up the allocator and return the raw arena
    pub fn into_arena(self) -> Box<[u8]> {
        self.arena
    }

    /// Zero the arena and install one free node spanning the usable region
    pub fn init(&mut self) {
        self.arena.fill(0);
        let capacity = self.capacity();
        self.write_u32(0, capacity);
        self.set_head(HEADER_SIZE);
        self.write_node(HEADER_SIZE, capacity - HEADER_SIZE, NIL);
    }

    /// Total arena size in bytes, header included
    pub fn capacity(&self) -> u32 {
        self.arena.len() as u32
    }

    /// Allocate `size` payload bytes
    ///
    /// Returns the payload offset, or `None` when no free node is large enough.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        let req = size.checked_add(TAG_SIZE)?.max(NODE_SIZE);

        let mut best: Option<(u32, u32, u32)> = None;
        let mut prev = NIL;
        let mut cur = self.head();
        while cur != NIL {
            let node_size = self.node_size(cur);
            if node_size >= req && best.map_or(true, |(_, _, s)| node_size < s) {
                best = Some((prev, cur, node_size));
                if node_size == req {
                    break;
                }
            }
            prev = cur;
            cur = self.node_next(cur);
        }

        let (prev, node, node_size) = best?;
        let next = self.node_next(node);
        let rest = node_size - req;

        let (block_size, replacement) = if rest > NODE_SIZE {
            let split = node + req;
            self.write_node(split, rest, next);
            (req, split)
        } else {
            (node_size, next)
        };

        self.set_link(prev, replacement);
        self.write_u32(node, block_size);
        Some(node + TAG_SIZE)
    }

    /// Release the block whose payload starts at `offset`
    ///
    /// Returns `false` and leaves the arena untouched when `offset` does not
    /// name a live block.
    pub fn free(&mut self, offset: u32) -> bool {
        if offset < HEADER_SIZE + TAG_SIZE || offset >= self.capacity() {
            return false;
        }
        let block = offset - TAG_SIZE;
        let size = self.read_u32(block);
        if size < NODE_SIZE || block.checked_add(size).map_or(true, |end| end > self.capacity()) {
            return false;
        }

        let mut prev = NIL;
        let mut cur = self.head();
        while cur != NIL && cur < block {
            prev = cur;
            cur = self.node_next(cur);
        }

        // Block overlapping a free node is a double free or a stray offset
        if cur != NIL && block + size > cur {
            return false;
        }
        if prev != NIL && prev + self.node_size(prev) > block {
            return false;
        }

        self.write_node(block, size, cur);
        self.set_link(prev, block);

        if cur != NIL && block + size == cur {
            let merged = size + self.node_size(cur);
            let next = self.node_next(cur);
            self.write_node(block, merged, next);
        }

        if prev != NIL && prev + self.node_size(prev) == block {
            let merged = self.node_size(prev) + self.node_size(block);
            let next = self.node_next(block);
            self.write_node(prev, merged, next);
        }

        true
    }

    /// Largest payload a single `alloc` can currently satisfy
    pub fn max_alloc_size(&self) -> u32 {
        self.nodes()
            .map(|(_, size)| size.saturating_sub(TAG_SIZE))
            .max()
            .unwrap_or(0)
    }

    /// Sum of all free node sizes
    pub fn remaining_size(&self) -> u32 {
        self.nodes().map(|(_, size)| size).sum()
    }

    /// Number of nodes on the free list
    pub fn free_nodes(&self) -> usize {
        self.nodes().count()
    }

    /// Payload capacity of the live block at `offset`
    pub fn block_size(&self, offset: u32) -> Option<u32> {
        let block = offset.checked_sub(TAG_SIZE)?;
        if block < HEADER_SIZE {
            return None;
        }
        let tag = self.try_read_u32(block)?;
        tag.checked_sub(TAG_SIZE)
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        self.arena.get(start..start.checked_add(len as usize)?)
    }

    /// Mutably borrow `len` bytes at `offset`
    pub fn bytes_mut(&mut self, offset: u32, len: u32) -> Option<&mut [u8]> {
        let start = offset as usize;
        self.arena.get_mut(start..start.checked_add(len as usize)?)
    }

    /// Read a little-endian `u32` stored at `offset`
    pub fn try_read_u32(&self, offset: u32) -> Option<u32> {
        let raw = self.bytes(offset, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(raw);
        Some(u32::from_le_bytes(buf))
    }

    /// Write a little-endian `u32` at `offset`, returning `false` when out of range
    pub fn try_write_u32(&mut self, offset: u32, value: u32) -> bool {
        match self.bytes_mut(offset, 4) {
            Some(raw) => {
                raw.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Whole arena, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.arena
    }

    fn nodes(&self) -> FreeNodes<'_> {
        FreeNodes {
            list: self,
            cur: self.head(),
        }
    }

    // Internal offsets are produced by this type and always in range.
    fn read_u32(&self, offset: u32) -> u32 {
        self.try_read_u32(offset).unwrap_or(0)
    }

    fn write_u32(&mut self, offset: u32, value: u32) {
        let written = self.try_write_u32(offset, value);
        debug_assert!(written, "write at {offset} outside the arena");
    }

    fn head(&self) -> u32 {
        self.read_u32(4)
    }

    fn set_head(&mut self, offset: u32) {
        self.write_u32(4, offset);
    }

    fn set_link(&mut self, prev: u32, target: u32) {
        if prev == NIL {
            self.set_head(target);
        } else {
            self.write_u32(prev + 4, target);
        }
    }

    fn node_size(&self, node: u32) -> u32 {
        self.read_u32(node)
    }

    fn node_next(&self, node: u32) -> u32 {
        self.read_u32(node + 4)
    }

    fn write_node(&mut self, node: u32, size: u32, next: u32) {
        self.write_u32(node, size);
        self.write_u32(node + 4, next);
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeList")
            .field("capacity", &self.capacity())
            .field("remaining", &self.remaining_size())
            .field("free_nodes", &self.free_nodes())
            .finish()
    }
}

/// Iterator over `(offset, size)` of free nodes
struct FreeNodes<'a> {
    list: &'a FreeList,
    cur: u32,
}

impl Iterator for FreeNodes<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == NIL {
            return None;
        }
        let node = self.cur;
        self.cur = self.list.node_next(node);
        Some((node, self.list.node_size(node)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_arena() {
        let list = FreeList::new(1024);
        assert_eq!(list.capacity(), 1024);
        assert_eq!(list.remaining_size(), 1016);
        assert_eq!(list.max_alloc_size(), 1012);
        assert_eq!(list.free_nodes(), 1);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let mut list = FreeList::new(1024);
        let before = list.remaining_size();

        let offset = list.alloc(100).unwrap();
        assert_eq!(offset, HEADER_SIZE + TAG_SIZE);
        assert_eq!(list.remaining_size(), before - 104);
        assert_eq!(list.block_size(offset), Some(100));

        assert!(list.free(offset));
        assert_eq!(list.remaining_size(), before);
        assert_eq!(list.free_nodes(), 1);
    }

    #[test]
    fn test_small_alloc_uses_min_node_size() {
        let mut list = FreeList::new(64);
        let offset = list.alloc(1).unwrap();
        assert_eq!(list.block_size(offset), Some(NODE_SIZE - TAG_SIZE));
        assert_eq!(list.remaining_size(), 56 - NODE_SIZE);
    }

    #[test]
    fn test_exact_fit_leaves_no_remainder() {
        let mut list = FreeList::new(1024);
        let offset = list.alloc(1012).unwrap();
        assert_eq!(list.remaining_size(), 0);
        assert_eq!(list.max_alloc_size(), 0);
        assert_eq!(list.free_nodes(), 0);
        assert!(list.alloc(1).is_none());

        assert!(list.free(offset));
        assert_eq!(list.remaining_size(), 1016);
    }

    #[test]
    fn test_small_remainder_is_absorbed() {
        let mut list = FreeList::new(1024);
        // 1008 requested bytes leave 8, which is not strictly larger than a node
        let offset = list.alloc(1004).unwrap();
        assert_eq!(list.remaining_size(), 0);
        assert_eq!(list.block_size(offset), Some(1012));

        assert!(list.free(offset));
        assert_eq!(list.remaining_size(), 1016);
    }

    #[test]
    fn test_capacity_failure() {
        let mut list = FreeList::new(128);
        assert!(list.alloc(200).is_none());
        assert!(list.alloc(u32::MAX).is_none());
        assert_eq!(list.remaining_size(), 120);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let mut list = FreeList::new(1024);
        let a = list.alloc(200).unwrap();
        let _s1 = list.alloc(10).unwrap();
        let b = list.alloc(100).unwrap();
        let _s2 = list.alloc(10).unwrap();

        assert!(list.free(a));
        assert!(list.free(b));
        assert_eq!(list.free_nodes(), 3);

        // First fit would return `a`, best fit picks the 104 byte hole
        assert_eq!(list.alloc(100), Some(b));
    }

    #[test]
    fn test_coalesce_adjacent_blocks() {
        let mut list = FreeList::new(1024);
        let a = list.alloc(100).unwrap();
        let b = list.alloc(100).unwrap();
        let _c = list.alloc(100).unwrap();
        let _d = list.alloc(700).unwrap();
        assert_eq!(list.remaining_size(), 0);

        assert!(list.free(a));
        assert!(list.free(b));
        assert_eq!(list.free_nodes(), 1);
        assert_eq!(list.remaining_size(), 208);
        assert_eq!(list.max_alloc_size(), 204);

        assert_eq!(list.alloc(204), Some(a));
    }

    #[test]
    fn test_three_way_merge() {
        let mut list = FreeList::new(1024);
        let a = list.alloc(100).unwrap();
        let b = list.alloc(100).unwrap();
        let c = list.alloc(100).unwrap();
        let _d = list.alloc(700).unwrap();

        assert!(list.free(a));
        assert!(list.free(c));
        assert_eq!(list.free_nodes(), 2);

        assert!(list.free(b));
        assert_eq!(list.free_nodes(), 1);
        assert_eq!(list.remaining_size(), 312);
    }

    #[test]
    fn test_free_into_empty_list() {
        let mut list = FreeList::new(256);
        let a = list.alloc(120).unwrap();
        let b = list.alloc(116).unwrap();
        assert_eq!(list.free_nodes(), 0);

        assert!(list.free(b));
        assert_eq!(list.free_nodes(), 1);
        assert_eq!(list.remaining_size(), 124);

        assert!(list.free(a));
        assert_eq!(list.remaining_size(), 248);
    }

    #[test]
    fn test_double_free_rejected() {
        let mut list = FreeList::new(512);
        let a = list.alloc(50).unwrap();
        let _b = list.alloc(50).unwrap();
        assert!(list.free(a));
        let remaining = list.remaining_size();

        assert!(!list.free(a));
        assert_eq!(list.remaining_size(), remaining);
    }

    #[test]
    fn test_invalid_offsets_rejected() {
        let mut list = FreeList::new(512);
        assert!(!list.free(0));
        assert!(!list.free(4));
        assert!(!list.free(10_000));
        assert_eq!(list.remaining_size(), 504);
    }

    #[test]
    fn test_payload_access() {
        let mut list = FreeList::new(512);
        let offset = list.alloc(5).unwrap();
        list.bytes_mut(offset, 5).unwrap().copy_from_slice(b"hello");
        assert_eq!(list.bytes(offset, 5).unwrap(), b"hello");
        assert!(list.bytes(510, 5).is_none());
    }

    #[test]
    fn test_arena_relocation() {
        let mut list = FreeList::new(512);
        let a = list.alloc(16).unwrap();
        list.bytes_mut(a, 4).unwrap().copy_from_slice(b"data");

        let arena = list.into_arena();
        let moved = arena.to_vec().into_boxed_slice();
        let mut list = FreeList::from_arena(moved).unwrap();

        assert_eq!(list.bytes(a, 4).unwrap(), b"data");
        assert!(list.free(a));
        assert_eq!(list.remaining_size(), 504);
    }

    #[test]
    fn test_from_arena_rejects_foreign_buffer() {
        assert!(FreeList::from_arena(vec![0u8; 4].into_boxed_slice()).is_none());
        assert!(FreeList::from_arena(vec![0xffu8; 64].into_boxed_slice()).is_none());
    }
}
