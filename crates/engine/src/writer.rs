//! The push contract shared by all writers.

mod file;
mod mem;

use std::time::SystemTime;

use spool_core::{AioResult, BufferLease, WaiterRef, NOSIZE};

use crate::error::OpenError;

pub use file::{FileWriter, FileWriterFactory, FileWriterOptions};
pub use mem::{BufferWriter, BufferWriterFactory};

/// Progress callback, invoked with the number of bytes just drained to
/// the sink.
///
/// Only for accounting: the callback runs on the writer's worker thread
/// with internal locks held and must never call back into the writer.
/// Idiomatic usage updates atomics and optionally wakes an event loop.
pub type ProgressFn = Box<dyn Fn(u64) + Send>;

/// A consumer of filled buffer leases.
///
/// The initial state of a freshly opened writer is writable:
/// [`add_buffer`](Self::add_buffer) can be called immediately. All
/// methods other than [`close`](Self::close) panic on a closed writer.
pub trait AioWriter: Send {
    /// Queues a filled lease for draining to the sink.
    ///
    /// An empty lease is accepted as a no-op. `AioResult::Wait` means
    /// the lease was accepted but the queue is now full; do not add
    /// another buffer until `waiter` has been signalled. After finalize
    /// has been requested, and on an errored writer, returns
    /// `AioResult::Error` (and the lease goes back to its pool
    /// unwritten).
    fn add_buffer(&mut self, lease: BufferLease, waiter: WaiterRef<'_>) -> AioResult;

    /// Drains the queue and completes the output.
    ///
    /// `AioResult::Ok` means every accepted byte reached the sink (and,
    /// where configured, disk). On `AioResult::Wait`, call again after
    /// `waiter` has been signalled.
    fn finalize(&mut self, waiter: WaiterRef<'_>) -> AioResult;

    /// Instructs the writer to preallocate storage for `size` further
    /// bytes. May be a no-op; only valid before any buffer was added
    /// and before finalize.
    fn preallocate(&mut self, size: u64) -> AioResult {
        let _ = size;
        AioResult::Ok
    }

    /// Sets the sink's modification time. Only valid once finalize has
    /// returned `AioResult::Ok`; returns `false` otherwise.
    fn set_mtime(&mut self, mtime: SystemTime) -> bool {
        let _ = mtime;
        false
    }

    /// Whether the writer has failed.
    fn error(&self) -> bool;

    /// Name of the writer, for diagnostics.
    fn name(&self) -> &str;

    /// Tears the writer down: stops its worker, removes every waiter
    /// registration and returns queued leases to the pool. Idempotent.
    fn close(&mut self);
}

/// A cloneable descriptor that opens writers on demand.
pub trait WriterFactory: Send {
    /// Deep-clones the factory.
    fn clone_box(&self) -> Box<dyn WriterFactory>;

    /// Opens a writer positioned at `offset`.
    ///
    /// Only [`offsetable`](Self::offsetable) sinks accept a non-zero
    /// offset. `max_buffers == 0` selects
    /// [`preferred_buffer_count`](Self::preferred_buffer_count).
    fn open(
        &self,
        offset: u64,
        progress: Option<ProgressFn>,
        max_buffers: usize,
    ) -> Result<Box<dyn AioWriter>, OpenError>;

    /// Name of the sink, for diagnostics.
    fn name(&self) -> &str;

    /// Whether writers can be opened at a position other than the
    /// beginning.
    fn offsetable(&self) -> bool {
        false
    }

    /// Pre-existing size of the sink, or `NOSIZE` if indetermined.
    fn size(&self) -> u64 {
        NOSIZE
    }

    /// Last modification time of the sink, when known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Sets the sink's modification time by name.
    ///
    /// If writers are still open for the entity behind this factory,
    /// the mtime may change again as they close.
    fn set_mtime(&self, mtime: SystemTime) -> bool {
        let _ = mtime;
        false
    }

    /// Minimum number of pool buffers the writer needs to make
    /// progress.
    fn min_buffer_usage(&self) -> usize {
        1
    }

    /// Whether the writer benefits from more than
    /// [`min_buffer_usage`](Self::min_buffer_usage) buffers.
    fn multiple_buffer_usage(&self) -> bool {
        false
    }

    /// Buffer count picked when `open` is called with `max_buffers == 0`.
    fn preferred_buffer_count(&self) -> usize {
        1
    }
}

impl Clone for Box<dyn WriterFactory> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
