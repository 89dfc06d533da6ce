//! The pull contract shared by all readers.

mod file;
mod mem;

use std::sync::Arc;
use std::time::SystemTime;

use spool_core::{AioResult, BufferLease, BufferPool, WaiterRef, NOSIZE};

use crate::error::OpenError;

pub use file::{FileReader, FileReaderFactory};
pub use mem::{MemReader, MemReaderFactory};

/// A producer of filled buffer leases.
///
/// The initial state of a freshly opened reader is readable:
/// [`get_buffer`](Self::get_buffer) can be called immediately. All
/// methods other than [`close`](Self::close) panic on a closed reader.
pub trait AioReader: Send {
    /// Pulls the next filled buffer.
    ///
    /// - `(AioResult::Ok, Some(lease))`: the next chunk, in source
    ///   order; consume it and drop the lease.
    /// - `(AioResult::Ok, None)`: end of the requested window.
    /// - `(AioResult::Wait, None)`: nothing available yet; do not call
    ///   again until `waiter` has been signalled.
    /// - `(AioResult::Error, None)`: the reader failed and can only be
    ///   closed.
    fn get_buffer(&mut self, waiter: WaiterRef<'_>) -> (AioResult, Option<BufferLease>);

    /// Repositions the read window to `size` bytes starting at `offset`
    /// (`NOSIZE` extends to the end of the source).
    ///
    /// Returns `false` if the window is not satisfiable or the reader
    /// cannot be repositioned; a reader that fails a seek is in an
    /// undefined state and must be closed. A seek that changes nothing
    /// succeeds without discarding buffered data.
    fn seek(&mut self, offset: u64, size: u64) -> bool;

    /// Restarts the current window from the beginning. Only seekable
    /// readers can be rewound once data has been delivered.
    fn rewind(&mut self) -> bool;

    /// Whether the reader can be repositioned after delivering data.
    fn seekable(&self) -> bool;

    /// Size of the current read window, or `NOSIZE` if indetermined.
    fn size(&self) -> u64;

    /// Last modification time of the source, when known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Name of the reader, for diagnostics.
    fn name(&self) -> &str;

    /// Whether the reader has failed.
    fn error(&self) -> bool;

    /// Tears the reader down: stops its worker, removes every waiter
    /// registration and returns buffered leases to the pool. Idempotent.
    fn close(&mut self);
}

/// A cloneable descriptor that opens readers on demand.
pub trait ReaderFactory: Send {
    /// Deep-clones the factory.
    fn clone_box(&self) -> Box<dyn ReaderFactory>;

    /// Opens a reader over `pool` covering `size` bytes from `offset`.
    ///
    /// Pass `offset == 0` and `size == NOSIZE` for the whole source;
    /// non-seekable sources only open at offset 0. A `size` that exceeds
    /// the source eventually drives the reader into an error.
    /// `max_buffers == 0` selects
    /// [`preferred_buffer_count`](Self::preferred_buffer_count).
    fn open(
        &self,
        pool: &Arc<BufferPool>,
        offset: u64,
        size: u64,
        max_buffers: usize,
    ) -> Result<Box<dyn AioReader>, OpenError>;

    /// Name of the source, for diagnostics.
    fn name(&self) -> &str;

    /// Whether readers from this factory can be repositioned.
    fn seekable(&self) -> bool {
        false
    }

    /// Size of the source, or `NOSIZE` if indetermined.
    fn size(&self) -> u64 {
        NOSIZE
    }

    /// Last modification time of the source, when known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Minimum number of pool buffers the reader needs to make
    /// progress. Size the pool to at least the sum over all involved
    /// readers and writers.
    fn min_buffer_usage(&self) -> usize {
        1
    }

    /// Whether the reader benefits from more than
    /// [`min_buffer_usage`](Self::min_buffer_usage) buffers.
    fn multiple_buffer_usage(&self) -> bool {
        false
    }

    /// Buffer count picked when `open` is called with `max_buffers == 0`.
    fn preferred_buffer_count(&self) -> usize {
        1
    }
}

impl Clone for Box<dyn ReaderFactory> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Outcome of validating a seek request against the current window.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum SeekPlan {
    /// The request matches the current window; keep buffered data.
    Unchanged,
    /// The request is not satisfiable.
    Rejected,
    /// Apply the resolved window.
    Apply {
        /// Resolved start offset.
        offset: u64,
        /// Resolved size (possibly `NOSIZE`).
        size: u64,
    },
}

/// The read-window state machine shared by every reader variant.
#[derive(Debug)]
pub(crate) struct ReadWindow {
    /// Size of the current window; `NOSIZE` if open-ended.
    pub size: u64,
    /// Size of the underlying source; `NOSIZE` if indetermined.
    pub max_size: u64,
    /// First source byte of the window.
    pub start_offset: u64,
    /// Bytes of the window not yet produced; `NOSIZE` if open-ended.
    pub remaining: u64,
    /// Whether a window has been established.
    pub window_set: bool,
    pub eof: bool,
    pub error: bool,
    /// Whether any buffer has been delivered from the current window.
    pub get_buffer_called: bool,
}

impl ReadWindow {
    pub(crate) fn new(max_size: u64) -> Self {
        Self {
            size: NOSIZE,
            max_size,
            start_offset: 0,
            remaining: NOSIZE,
            window_set: false,
            eof: false,
            error: false,
            get_buffer_called: false,
        }
    }

    /// Validates a seek request without mutating the window.
    pub(crate) fn check_seek(&self, offset: u64, size: u64, seekable: bool) -> SeekPlan {
        let mut offset = offset;
        let mut size = size;
        if offset == NOSIZE {
            offset = if self.window_set { self.start_offset } else { 0 };
            if size == NOSIZE {
                size = self.size;
            }
        }

        if size != NOSIZE && NOSIZE - size <= offset {
            // offset + size overflows into (or past) the sentinel.
            return SeekPlan::Rejected;
        }
        if size != NOSIZE && offset + size > self.max_size {
            return SeekPlan::Rejected;
        }
        if size == NOSIZE && self.max_size != NOSIZE && offset > self.max_size {
            return SeekPlan::Rejected;
        }

        let mut change =
            !self.window_set || self.get_buffer_called || offset != self.start_offset;
        if size == NOSIZE {
            // A previous size restriction is lifted unless the window
            // already ran to the end of the source.
            if offset.wrapping_add(self.size) != self.max_size {
                change = true;
            }
        } else if size != self.size {
            change = true;
        }
        if !change {
            return SeekPlan::Unchanged;
        }

        if !seekable && (self.window_set || offset != 0) {
            // Cannot restart, nor start anywhere but the beginning.
            return SeekPlan::Rejected;
        }

        SeekPlan::Apply { offset, size }
    }

    /// Installs a window previously resolved by
    /// [`check_seek`](Self::check_seek).
    pub(crate) fn apply_seek(&mut self, offset: u64, size: u64) {
        self.start_offset = offset;
        self.size = if size != NOSIZE {
            size
        } else if self.max_size != NOSIZE {
            self.max_size - offset
        } else {
            NOSIZE
        };
        self.remaining = self.size;
        self.eof = self.remaining == 0;
        self.get_buffer_called = false;
        self.window_set = true;
    }
}
