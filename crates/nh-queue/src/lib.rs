//! Priority-partitioned notification queues
//!
//! This crate provides the queue backing store for the dispatch engine:
//! - QueueStore: the store contract consumed by worker pools and maintenance
//! - MemoryQueueStore: in-process implementation with per-channel priority
//!   queues, a processing set, a dead-letter store, and rolling rate counters
//!
//! The store is the single point of truth for item location: an item is in
//! exactly one of {priority queue, processing set, dead-letter store}, and
//! every operation moves it between those atomically.

pub mod memory;
pub mod store;

pub use memory::MemoryQueueStore;
pub use store::{EnqueueAck, EnqueueResult, QueueStore};

pub type Result<T> = std::result::Result<T, nh_common::StoreError>;
