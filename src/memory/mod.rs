//! Memory Management
//!
//! Arena allocation for the RAM tier. Slabs hand out byte ranges from a
//! [`FreeList`] and address them only by offset.

pub mod free_list;
mod proptest;

pub use free_list::{FreeList, HEADER_SIZE, NODE_SIZE, TAG_SIZE};
