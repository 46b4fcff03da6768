//! Shared domain types for Palaver.
//!
//! This crate contains the types used across the gateway: conversation
//! messages, the persistence queue wire format, backend request/stream
//! shapes, configuration and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod llm;
pub mod persistence;
