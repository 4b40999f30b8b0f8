//! Adapters for the domain ports.

pub mod audit;
pub mod clock;
pub mod http_scorer;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
