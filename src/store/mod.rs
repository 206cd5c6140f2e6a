//! Hybrid Key/Value Storage
//!
//! - [`slab`] - fixed-size record arenas on top of the free list
//! - [`ram`] - slab collection with usage tracking and whole-slab eviction
//! - [`disk`] - append-only log for values that do not fit in RAM
//! - [`hybrid`] - the two tiers combined, with working-set tracking

pub mod disk;
pub mod hybrid;
pub mod ram;
pub mod slab;

pub use disk::{DiskCollection, DiskConfig, LOG_FILE};
pub use hybrid::{
    HybridKVStore, Lookup, StorageTier, StoreConfig, StoreStats, DEFAULT_MAX_KEY_SIZE,
    DEFAULT_MAX_VALUE_SIZE,
};
pub use ram::{MetaRamCollection, SlabUsage};
pub use slab::{RamSlab, SlabId, DEFAULT_SLAB_SIZE};
