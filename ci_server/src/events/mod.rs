//! Lifecycle events for CI records.
//!
//! Builds move through their states only by applying events; the store
//! applies them under its own lock.

pub mod build;
