//! The in-memory buffer writer.

use std::sync::{Arc, Mutex};

use spool_core::{AioResult, BufferLease, WaiterRef};

use crate::error::OpenError;
use crate::writer::{AioWriter, ProgressFn, WriterFactory};

/// Appends incoming leases to a shared in-memory buffer.
///
/// Runs entirely on the calling thread and never returns
/// `AioResult::Wait`. The sink is externally owned; exceeding
/// `size_limit` marks the writer errored and the rejected lease goes
/// back to its pool unwritten.
pub struct BufferWriter {
    name: String,
    sink: Arc<Mutex<Vec<u8>>>,
    size_limit: usize,
    progress: Option<ProgressFn>,
    error: bool,
    finalized: bool,
    closed: bool,
}

impl BufferWriter {
    /// Creates a writer appending to `sink`, refusing to grow it past
    /// `size_limit` bytes.
    pub fn new(
        name: impl Into<String>,
        sink: Arc<Mutex<Vec<u8>>>,
        size_limit: usize,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            name: name.into(),
            sink,
            size_limit,
            progress,
            error: false,
            finalized: false,
            closed: false,
        }
    }
}

impl AioWriter for BufferWriter {
    fn add_buffer(&mut self, lease: BufferLease, _waiter: WaiterRef<'_>) -> AioResult {
        assert!(!self.closed, "add_buffer on a closed writer");
        if self.error || self.finalized {
            return AioResult::Error;
        }
        if lease.is_empty() {
            return AioResult::Ok;
        }

        let mut sink = self.sink.lock().expect("sink mutex poisoned");
        if self.size_limit.saturating_sub(sink.len()) < lease.len() {
            drop(sink);
            tracing::debug!(name = %self.name, "buffer writer size limit exceeded");
            self.error = true;
            return AioResult::Error;
        }
        sink.extend_from_slice(lease.readable());
        drop(sink);
        if let Some(progress) = self.progress.as_ref() {
            progress(lease.len() as u64);
        }
        AioResult::Ok
    }

    fn finalize(&mut self, _waiter: WaiterRef<'_>) -> AioResult {
        assert!(!self.closed, "finalize on a closed writer");
        if self.error {
            AioResult::Error
        } else {
            self.finalized = true;
            AioResult::Ok
        }
    }

    fn preallocate(&mut self, size: u64) -> AioResult {
        assert!(!self.closed, "preallocate on a closed writer");
        if size > self.size_limit as u64 {
            return AioResult::Error;
        }
        self.sink.lock().expect("sink mutex poisoned").reserve(size as usize);
        AioResult::Ok
    }

    fn error(&self) -> bool {
        self.error
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Factory for [`BufferWriter`]s over one shared sink.
///
/// Never open two writers for the same sink at once; the writers do not
/// coordinate beyond the mutex guarding individual appends.
#[derive(Clone)]
pub struct BufferWriterFactory {
    name: String,
    sink: Arc<Mutex<Vec<u8>>>,
    size_limit: usize,
}

impl BufferWriterFactory {
    /// Creates a factory appending to `sink`, bounded by `size_limit`.
    pub fn new(name: impl Into<String>, sink: Arc<Mutex<Vec<u8>>>, size_limit: usize) -> Self {
        Self {
            name: name.into(),
            sink,
            size_limit,
        }
    }
}

impl WriterFactory for BufferWriterFactory {
    fn clone_box(&self) -> Box<dyn WriterFactory> {
        Box::new(self.clone())
    }

    fn open(
        &self,
        offset: u64,
        progress: Option<ProgressFn>,
        _max_buffers: usize,
    ) -> Result<Box<dyn AioWriter>, OpenError> {
        if offset != 0 {
            return Err(OpenError::NotOffsetable {
                name: self.name.clone(),
            });
        }
        Ok(Box::new(BufferWriter::new(
            self.name.clone(),
            Arc::clone(&self.sink),
            self.size_limit,
            progress,
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
