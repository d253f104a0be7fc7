//! Named, versioned response stores and the strategies that use them.
//!
//! This module provides:
//! - A storage backend holding any number of named stores keyed by request
//! - Cache-first, network-first and stale-while-revalidate strategies
//! - Offline mode (serve cached responses when the network is unavailable)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
