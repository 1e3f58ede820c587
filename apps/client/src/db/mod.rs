//! Local key-value storage.

pub mod error;
pub mod kv;
pub mod schema;

pub use error::StoreError;
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore};
