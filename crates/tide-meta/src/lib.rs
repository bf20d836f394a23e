//! Metadata caches wrapping Fjall.
//!
//! The caches are a **local index** over the fragments on disk, never the
//! source of truth. Both are rebuilt by the populate-cache repair tasks:
//!
//! - `sys`: one record per object chunk present on this node's disks
//! - `ext`: one record per user-visible object (first chunk of data objects)
//!
//! Records are keyed by `partition (4 bytes BE) ++ object id`, so a partition
//! is one contiguous key range and can be paged with a resumption cookie.

mod error;
mod store;

pub use error::MetaError;
pub use store::{CacheHandle, CacheKind, CacheRecord, Cookie, MetaCache, MetaStore, Page};
