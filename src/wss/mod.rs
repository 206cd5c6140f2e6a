//! Working-Set-Size Estimation
//!
//! A cuckoo filter that keeps a size and an access counter next to every
//! fingerprint, and an estimator that buckets keys by how often they are read.
//!
//! # Components
//!
//! - **Table** (`table.rs`): 4-way bucketed slot array
//! - **CuckooFilter** (`cuckoo.rs`): tags, alternate buckets, victim slot
//! - **WssEstimator** (`estimator.rs`): 3-bucket access distribution

pub mod cuckoo;
pub mod estimator;
pub mod table;

pub use cuckoo::{CuckooFilter, FilterError, MAX_KICKS};
pub use estimator::{Bucket, WssEstimator, STAGES};
pub use table::{Item, Table};
