//! Infrastructure layer for Palaver.
//!
//! Contains implementations of the traits defined in `palaver-core`: the
//! SQLite message store, the AMQP broker adapter, the streaming text
//! generation backends, and the TOML configuration loader.

pub mod broker;
pub mod config;
pub mod llm;
pub mod sqlite;
