//! Cache Instance Service
//!
//! # Components
//!
//! - **Entity** (`entity.rs`): the store, per-tick counters and the tick loop
//! - **Protocol** (`protocol.rs`): get/set frames on the client socket
//! - **Server** (`server.rs`): TCP accept loop and a matching client

pub mod entity;
pub mod protocol;
pub mod server;

pub use entity::{CacheInstance, InstanceConfig, InstanceStats};
pub use protocol::{FrameLimits, Request};
pub use server::{CacheClient, CacheServer, DEFAULT_MAX_CONNECTIONS};
