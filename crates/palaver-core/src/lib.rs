//! Conversation core and ports for Palaver.
//!
//! This crate defines the "ports" (backend, persistence, broker and
//! repository traits) that the infrastructure layer implements, plus the
//! concurrency core built on them. It depends only on `palaver-types`,
//! never on `palaver-infra` or any database/IO crate.

pub mod chat;
pub mod llm;
pub mod persist;
pub mod queue;
pub mod repository;
pub mod session;
