//! Error types for the metadata caches.

/// Errors returned by [`MetaStore`](crate::MetaStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// Fjall database error.
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    /// I/O error (e.g. from Fjall guard operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] postcard::Error),

    /// The cache has not finished loading.
    #[error("cache not ready: {0}")]
    NotReady(&'static str),

    /// A stored key could not be decoded.
    #[error("malformed cache key ({0} bytes)")]
    MalformedKey(usize),
}
