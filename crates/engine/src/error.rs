//! Error types for opening readers and writers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error raised when a factory cannot produce a live reader or writer.
///
/// Runtime failures after a successful open never surface as errors of
/// this type; they mark the object and are reported as
/// [`AioResult::Error`](spool_core::AioResult) from its operations.
#[derive(Debug, Error)]
pub enum OpenError {
    /// An I/O error occurred while opening or preparing the source or
    /// sink.
    #[error("failed to {action} '{path}': {source}", path = path.display())]
    Io {
        /// The action being performed (e.g. "open", "truncate").
        action: &'static str,
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The requested read window cannot be satisfied by the source.
    #[error("requested window (offset {offset}, size {size}) is not satisfiable by '{name}'")]
    InvalidWindow {
        /// Name of the reader that rejected the window.
        name: String,
        /// Requested start offset.
        offset: u64,
        /// Requested window size.
        size: u64,
    },

    /// The worker thread backing the object could not be started.
    #[error("could not start a worker thread for '{name}'")]
    Worker {
        /// Name of the reader or writer.
        name: String,
    },

    /// The sink only supports opening from the beginning.
    #[error("'{name}' does not accept an open offset")]
    NotOffsetable {
        /// Name of the writer.
        name: String,
    },
}
