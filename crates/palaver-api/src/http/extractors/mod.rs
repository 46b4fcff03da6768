//! Request extractors.

pub mod username;
