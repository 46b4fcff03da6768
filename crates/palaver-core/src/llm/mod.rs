//! Backend abstractions for Palaver.
//!
//! - `LlmProvider`: trait for concrete streaming backends
//! - `BoxLlmProvider`: object-safe wrapper for dynamic dispatch
//! - `BackendFactory`: model type tag to constructor registry

pub mod box_provider;
pub mod factory;
pub mod provider;
pub mod scripted;
