//! Error types for fragment storage operations.

use tide_types::{DiskId, FragmentRef};

/// Errors that can occur during fragment storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested fragment does not exist on the disk.
    #[error("fragment not found: {0}")]
    NotFound(FragmentRef),

    /// Checksum verification failed.
    #[error("fragment {fragment} corrupted on {disk}: {detail}")]
    Corrupted {
        /// The fragment that failed verification.
        fragment: FragmentRef,
        /// The disk holding it.
        disk: DiskId,
        /// Which check failed.
        detail: String,
    },

    /// The disk cannot be reached right now.
    #[error("disk unreachable: {0}")]
    Unreachable(DiskId),

    /// Too few healthy fragments to rebuild the object.
    #[error("not enough fragments to rebuild: need {needed}, got {got}")]
    InsufficientFragments {
        /// Fragments required.
        needed: usize,
        /// Fragments found.
        got: usize,
    },

    /// Reed-Solomon encode or decode failed.
    #[error("erasure coding error: {0}")]
    Erasure(#[from] reed_solomon_simd::Error),

    /// A peer returned an error for a remote operation.
    #[error("remote error: {0}")]
    Remote(String),

    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error says the fragment is simply absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Whether the error reports checksum corruption.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, StoreError::Corrupted { .. })
    }
}
