//! Embedded Nostr event store: composite secondary indexes over an ordered
//! key-value engine, and a filter planner that merges several descending
//! index scans into one newest-first, limit-bounded stream.

pub mod config;
pub mod error;
pub mod storage;
