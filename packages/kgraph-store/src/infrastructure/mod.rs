//! Infrastructure layer - storage adapters
//!
//! - SQLite adapter (feature `sqlite`, default)
//! - In-memory adapter (tests, embedding into other processes)

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryItemStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteItemStore;
