//! Pull-style readers and push-style writers over pooled buffers.
//!
//! A reader produces a lazy sequence of filled
//! [`BufferLease`](spool_core::BufferLease)s from its source; a writer
//! accepts filled leases and drains them to its sink. File-backed
//! variants own one background worker thread each, so the foreground
//! never blocks on disk I/O: whenever a queue runs empty or full the
//! operation returns [`AioResult::Wait`](spool_core::AioResult) and the
//! caller's waiter is signalled once the state changes.
//!
//! Readers emit buffers in strictly ascending source order; writers
//! drain buffers in exactly the order they were accepted. Dropping a
//! lease at any point returns the buffer to its pool.
//!
//! Factories ([`ReaderFactory`], [`WriterFactory`]) are cloneable
//! descriptors that defer opening the underlying source or sink until
//! [`open`](ReaderFactory::open) and carry sizing metadata used to
//! dimension the shared pool.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

pub mod error;
pub mod pipeline;
pub mod reader;
pub mod writer;

pub use error::OpenError;
pub use pipeline::{pump, PipelineError};
pub use reader::{
    AioReader, FileReader, FileReaderFactory, MemReader, MemReaderFactory, ReaderFactory,
};
pub use writer::{
    AioWriter, BufferWriter, BufferWriterFactory, FileWriter, FileWriterFactory,
    FileWriterOptions, ProgressFn, WriterFactory,
};
