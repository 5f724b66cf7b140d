//! Shared store for targets, samples, alert rules and node roles
//!
//! ## Design
//!
//! - **Trait-based**: [`Store`] lets the dispatcher, the notifier and the
//!   control CLI run against any backend
//! - **Async**: all operations are async so session tasks never block the runtime
//! - **Operation-scoped**: no connection or transaction outlives a single call
//!
//! ## Backends
//!
//! - **SQLite** (default): embedded database shared by every role on a host
//! - **In-Memory**: no persistence, for tests and local runs
//!
//! ## Usage
//!
//! ```no_run
//! use pageprobe::storage::{Store, sqlite::SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::new("./pageprobe.db").await?;
//!     let target = store.follow_url("https://example.com").await?;
//!     println!("following {} ({} followers)", target.url, target.reference_count);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use backend::{HealthStatus, Store};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::StorageConfig;

/// Open the backend selected in the configuration
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn Store>> {
    match config {
        StorageConfig::None => Ok(Arc::new(MemoryStore::new())),
        StorageConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::new(path).await?)),
    }
}
