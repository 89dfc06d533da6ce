//! A blocking driver moving every byte from a reader to a writer.

use std::sync::Arc;

use thiserror::Error;

use spool_core::{AioResult, AioWaiter, BlockingWaiter, WaiterRef};

use crate::reader::AioReader;
use crate::writer::AioWriter;

/// Error raised when a pipeline cannot complete.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The reader failed mid-stream.
    #[error("reader '{0}' failed")]
    Read(String),
    /// The writer failed mid-stream or during finalize.
    #[error("writer '{0}' failed")]
    Write(String),
}

/// Pulls `reader` to the end of its window, pushes everything into
/// `writer` and finalizes it. Returns the number of bytes moved.
///
/// Parks the calling thread whenever both sides are momentarily busy;
/// event-driven callers should drive the same loop from their own
/// handler instead.
pub fn pump(reader: &mut dyn AioReader, writer: &mut dyn AioWriter) -> Result<u64, PipelineError> {
    let blocking = BlockingWaiter::new();
    let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
    let mut moved = 0u64;

    loop {
        match reader.get_buffer(WaiterRef::Task(&waiter)) {
            (AioResult::Wait, _) => blocking.wait(),
            (AioResult::Error, _) => return Err(PipelineError::Read(reader.name().to_string())),
            (AioResult::Ok, None) => break,
            (AioResult::Ok, Some(lease)) => {
                moved += lease.len() as u64;
                match writer.add_buffer(lease, WaiterRef::Task(&waiter)) {
                    AioResult::Ok => {}
                    AioResult::Wait => blocking.wait(),
                    AioResult::Error => {
                        return Err(PipelineError::Write(writer.name().to_string()));
                    }
                }
            }
        }
    }

    loop {
        match writer.finalize(WaiterRef::Task(&waiter)) {
            AioResult::Ok => return Ok(moved),
            AioResult::Wait => blocking.wait(),
            AioResult::Error => return Err(PipelineError::Write(writer.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MemReader;
    use crate::writer::BufferWriter;
    use spool_core::{BufferPool, PoolConfig};
    use std::sync::Mutex;

    #[test]
    fn round_trips_through_a_tiny_pool() {
        // One 8-byte buffer forces the wait paths on both sides.
        let pool = BufferPool::with_config(PoolConfig {
            buffer_count: 1,
            buffer_size: 8,
            ..PoolConfig::default()
        })
        .unwrap();

        let data: Vec<u8> = (0..1000u16).flat_map(|i| i.to_be_bytes()).collect();
        let mut reader = MemReader::from_slice("source", &pool, &data);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut writer = BufferWriter::new("sink", Arc::clone(&sink), usize::MAX, None);

        let moved = pump(&mut reader, &mut writer).unwrap();
        assert_eq!(moved, data.len() as u64);
        assert_eq!(sink.lock().unwrap().as_slice(), &data[..]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn writer_quota_fails_the_pipeline() {
        let pool = BufferPool::with_config(PoolConfig {
            buffer_count: 1,
            buffer_size: 16,
            ..PoolConfig::default()
        })
        .unwrap();

        let mut reader = MemReader::from_slice("source", &pool, &[0u8; 64]);
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut writer = BufferWriter::new("sink", sink, 20, None);

        assert!(matches!(
            pump(&mut reader, &mut writer),
            Err(PipelineError::Write(_))
        ));
        assert_eq!(pool.available(), 1);
    }
}
