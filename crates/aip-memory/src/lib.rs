//! Discovery store backends for the AIP agent runtime.
//!
//! Two implementations of [`aip_types::discovery::DiscoveryStore`]:
//! - **In-memory**: a process-local map, used by tests and short-lived hubs
//! - **SQLite**: durable records surviving config hub restarts
//!
//! [`open_store`] picks one from the `[store]` config section.

pub mod memory;
pub mod migration;
pub mod sqlite;

pub use memory::MemoryDiscoveryStore;
pub use sqlite::SqliteDiscoveryStore;

use aip_types::config::StoreConfig;
use aip_types::discovery::DiscoveryStore;
use aip_types::error::AipResult;
use std::sync::Arc;

/// Build the store described by `config`: SQLite when a path is set, memory otherwise.
pub fn open_store(config: &StoreConfig) -> AipResult<Arc<dyn DiscoveryStore>> {
    match &config.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Opening SQLite discovery store");
            Ok(Arc::new(SqliteDiscoveryStore::open(path)?))
        }
        None => {
            tracing::debug!("Using in-memory discovery store");
            Ok(Arc::new(MemoryDiscoveryStore::new()))
        }
    }
}
