//! Storage abstraction layer for spendwatch
//!
//! This crate provides repository implementations for cost records, jobs,
//! and alerts. The in-memory backends are the development and test path;
//! the repository traits in `spendwatch-core` are the seam for anything
//! durable.

pub mod memory;

pub use memory::{InMemoryAlertRepository, InMemoryCostRepository, InMemoryJobRepository};
