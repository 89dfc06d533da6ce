//! Error types for pool construction.

use std::io;

use thiserror::Error;

/// Error raised when a buffer pool cannot be brought up.
///
/// Construction is the only fallible pool operation; once a pool exists,
/// exhaustion is handled cooperatively through waiters rather than
/// through errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The requested configuration cannot describe a usable pool.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),

    /// The private backing allocation failed.
    #[error("failed to allocate {size} bytes for the buffer region")]
    Alloc {
        /// Size of the region that was requested.
        size: usize,
    },

    /// The shared memory object could not be created or sized.
    #[error("failed to create shared memory region: {source}")]
    ShmCreate {
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The shared memory object could not be mapped.
    #[error("failed to map shared memory region: {source}")]
    ShmMap {
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Shared backing was requested on a platform without support.
    #[error("shared memory pools are not supported on this platform")]
    ShmUnsupported,
}
