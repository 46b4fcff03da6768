//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (palaver-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod message;

pub use memory::InMemoryMessageStore;
pub use message::MessageStore;
