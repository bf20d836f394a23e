//! Fragment storage seams and backends.
//!
//! This crate defines the two traits the repair engine drives storage
//! through:
//!
//! - [`FragmentEngine`]: open, read, verify, write, delete and reconstruct
//!   one fragment on one disk.
//! - [`FragmentLister`]: list a disk's committed fragments per partition and
//!   its temp directory.
//!
//! Backends:
//!
//! - [`MemoryStore`]: a cell-wide in-memory backend with per-block
//!   checksums and Reed-Solomon reconstruction.
//! - [`SlowStore`]: wraps any backend and injects seeded random latency.

pub mod codec;
mod error;
mod memory_store;
mod slow_store;
mod traits;

pub use error::StoreError;
pub use memory_store::MemoryStore;
pub use slow_store::SlowStore;
pub use traits::{FragmentEngine, FragmentLister, FragmentStat, StoredFragment};
