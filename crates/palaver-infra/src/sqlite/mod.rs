//! SQLite storage layer.
//!
//! Conversation storage backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod message;
pub mod pool;

pub use message::SqliteMessageStore;
pub use pool::DatabasePool;
