//! Buffer-brokered asynchronous file I/O.
//!
//! `spool` moves fixed-size buffers between producers and consumers
//! through a fixed-capacity [`BufferPool`]: a reader leases empty
//! buffers, fills them from its source on a background worker, and
//! queues them for the foreground; the foreground hands the filled
//! leases to a writer, whose worker drains them to the sink. Dropping a
//! lease returns its buffer to the pool, and a cooperative waiter
//! protocol wakes whichever party was blocked on the transition.
//!
//! The crate re-exports the two workspace layers:
//!
//! - [`spool_core`]: the pool, leases and the notification substrate.
//! - [`spool_engine`]: readers, writers, factories and the blocking
//!   [`pump`] driver.
//!
//! See the `spool-copy` binary for an event-driven end-to-end example.

pub use spool_core::{
    AioEventHandler, AioResult, AioWaiter, BlockingWaiter, BufferEventQueue, BufferLease,
    BufferPool, PoolBacking, PoolBuffer, PoolConfig, PoolError, SignalRelay, Waitable,
    WaitableToken, WaiterRef, DEFAULT_BUFFER_SIZE, NOSIZE,
};

#[cfg(unix)]
pub use spool_core::SharedMemoryInfo;

pub use spool_engine::{
    pump, AioReader, AioWriter, BufferWriter, BufferWriterFactory, FileReader, FileReaderFactory,
    FileWriter, FileWriterFactory, FileWriterOptions, MemReader, MemReaderFactory, OpenError,
    PipelineError, ProgressFn, ReaderFactory, WriterFactory,
};
