//! Task list client with an optimistic, self-reconciling cache.

pub mod cache;
pub mod config;
pub mod task;
pub mod transport;
