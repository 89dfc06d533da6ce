//! In-memory readers over shared or owned bytes.

use std::sync::Arc;

use bytes::Bytes;

use spool_core::{
    AioResult, AioWaiter, BufferLease, BufferPool, SignalRelay, WaiterRef, NOSIZE,
};

use crate::error::OpenError;
use crate::reader::{AioReader, ReadWindow, ReaderFactory, SeekPlan};

/// Reads from a byte region held in memory.
///
/// Runs entirely on the calling thread: each
/// [`get_buffer`](AioReader::get_buffer) leases one pool buffer and
/// copies the next window chunk into it. [`from_bytes`](Self::from_bytes)
/// shares the region without copying; [`from_slice`](Self::from_slice)
/// and [`from_string`](Self::from_string) take their own copy. Always
/// seekable.
pub struct MemReader {
    name: String,
    pool: Arc<BufferPool>,
    data: Bytes,
    window: ReadWindow,
    relay: Arc<SignalRelay>,
    closed: bool,
}

impl MemReader {
    /// Creates a reader sharing `data` without copying.
    pub fn from_bytes(name: impl Into<String>, pool: &Arc<BufferPool>, data: Bytes) -> Self {
        let mut window = ReadWindow::new(data.len() as u64);
        window.apply_seek(0, NOSIZE);
        Self {
            name: name.into(),
            pool: Arc::clone(pool),
            data,
            window,
            relay: SignalRelay::new(),
            closed: false,
        }
    }

    /// Creates a reader over a private copy of `data`.
    pub fn from_slice(name: impl Into<String>, pool: &Arc<BufferPool>, data: &[u8]) -> Self {
        Self::from_bytes(name, pool, Bytes::copy_from_slice(data))
    }

    /// Creates a reader owning the bytes of `data`.
    pub fn from_string(name: impl Into<String>, pool: &Arc<BufferPool>, data: String) -> Self {
        Self::from_bytes(name, pool, Bytes::from(data.into_bytes()))
    }

    fn relay_waiter(&self) -> Arc<dyn AioWaiter> {
        Arc::clone(&self.relay) as Arc<dyn AioWaiter>
    }
}

impl AioReader for MemReader {
    fn get_buffer(&mut self, waiter: WaiterRef<'_>) -> (AioResult, Option<BufferLease>) {
        assert!(!self.closed, "get_buffer on a closed reader");
        if self.window.error {
            return (AioResult::Error, None);
        }
        if self.window.eof {
            return (AioResult::Ok, None);
        }

        let relay = self.relay_waiter();
        let Some(mut lease) = BufferPool::get_buffer(&self.pool, WaiterRef::Task(&relay)) else {
            // The pool will signal the relay, which forwards to the
            // caller's waiter.
            self.relay.waitable().add_waiter(waiter);
            return (AioResult::Wait, None);
        };

        let want = (lease.capacity() as u64).min(self.window.remaining) as usize;
        let pos = (self.window.start_offset + (self.window.size - self.window.remaining)) as usize;
        lease.append(&self.data[pos..pos + want]);
        self.window.remaining -= want as u64;
        if self.window.remaining == 0 {
            self.window.eof = true;
        }
        self.window.get_buffer_called = true;
        (AioResult::Ok, Some(lease))
    }

    fn seek(&mut self, offset: u64, size: u64) -> bool {
        assert!(!self.closed, "seek on a closed reader");
        if self.window.error {
            return false;
        }
        match self.window.check_seek(offset, size, true) {
            SeekPlan::Unchanged => true,
            SeekPlan::Rejected => false,
            SeekPlan::Apply { offset, size } => {
                let relay = self.relay_waiter();
                self.pool.remove_waiter(WaiterRef::Task(&relay));
                self.relay.waitable().remove_waiters();
                self.window.apply_seek(offset, size);
                true
            }
        }
    }

    fn rewind(&mut self) -> bool {
        let (offset, size) = (self.window.start_offset, self.window.size);
        self.seek(offset, size)
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        self.window.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn error(&self) -> bool {
        self.window.error
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let relay = self.relay_waiter();
        self.pool.remove_waiter(WaiterRef::Task(&relay));
        self.relay.waitable().remove_waiters();
    }
}

impl Drop for MemReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`MemReader`]s.
#[derive(Clone)]
pub struct MemReaderFactory {
    name: String,
    data: Bytes,
}

impl MemReaderFactory {
    /// Creates a factory sharing `data` without copying.
    pub fn from_bytes(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Creates a factory over a private copy of `data`.
    pub fn from_slice(name: impl Into<String>, data: &[u8]) -> Self {
        Self::from_bytes(name, Bytes::copy_from_slice(data))
    }

    /// Creates a factory owning the bytes of `data`.
    pub fn from_string(name: impl Into<String>, data: String) -> Self {
        Self::from_bytes(name, Bytes::from(data.into_bytes()))
    }
}

impl ReaderFactory for MemReaderFactory {
    fn clone_box(&self) -> Box<dyn ReaderFactory> {
        Box::new(self.clone())
    }

    fn open(
        &self,
        pool: &Arc<BufferPool>,
        offset: u64,
        size: u64,
        _max_buffers: usize,
    ) -> Result<Box<dyn AioReader>, OpenError> {
        let mut reader = MemReader::from_bytes(self.name.clone(), pool, self.data.clone());
        if (offset != 0 || size != NOSIZE) && !reader.seek(offset, size) {
            return Err(OpenError::InvalidWindow {
                name: self.name.clone(),
                offset,
                size,
            });
        }
        Ok(Box::new(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::{BlockingWaiter, PoolConfig};
    use std::time::Duration;

    fn pool(count: usize, size: usize) -> Arc<BufferPool> {
        BufferPool::with_config(PoolConfig {
            buffer_count: count,
            buffer_size: size,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    fn drain(reader: &mut dyn AioReader) -> Vec<u8> {
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
        let mut out = Vec::new();
        loop {
            match reader.get_buffer(WaiterRef::Task(&waiter)) {
                (AioResult::Wait, _) => {
                    assert!(blocking.wait_timeout(Duration::from_secs(10)), "stalled");
                }
                (AioResult::Error, _) => panic!("reader errored"),
                (AioResult::Ok, None) => return out,
                (AioResult::Ok, Some(lease)) => out.extend_from_slice(lease.readable()),
            }
        }
    }

    #[test]
    fn delivers_all_bytes() {
        let pool = pool(1, 4);
        let mut reader = MemReader::from_slice("mem", &pool, b"ABCDEFGHIJ");
        // Buffers are 4 bytes, so this takes several leases.
        assert_eq!(drain(&mut reader), b"ABCDEFGHIJ");
    }

    #[test]
    fn bounded_window() {
        let pool = pool(1, 64);
        let factory = MemReaderFactory::from_slice("mem", b"ABCDEFGHIJ");
        let mut reader = factory.open(&pool, 3, 4, 0).unwrap();
        assert_eq!(drain(reader.as_mut()), b"DEFG");
    }

    #[test]
    fn empty_source_is_immediate_eof() {
        let pool = pool(1, 64);
        let mut reader = MemReader::from_slice("mem", &pool, b"");
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
        let (result, lease) = reader.get_buffer(WaiterRef::Task(&waiter));
        assert_eq!(result, AioResult::Ok);
        assert!(lease.is_none());
    }

    #[test]
    fn rewind_replays_identically() {
        let pool = pool(1, 64);
        let mut reader = MemReader::from_string("mem", &pool, "HELLO".to_string());
        assert_eq!(drain(&mut reader), b"HELLO");
        assert!(reader.rewind());
        assert_eq!(drain(&mut reader), b"HELLO");
    }

    #[test]
    fn window_past_source_fails_to_open() {
        let pool = pool(1, 64);
        let factory = MemReaderFactory::from_slice("mem", b"12345");
        assert!(matches!(
            factory.open(&pool, 0, 6, 0),
            Err(OpenError::InvalidWindow { .. })
        ));
        assert!(matches!(
            factory.open(&pool, 6, NOSIZE, 0),
            Err(OpenError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn dry_pool_waits_and_resumes() {
        let pool = pool(1, 64);
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;

        let gate = BufferPool::get_buffer(&pool, WaiterRef::Task(&waiter)).unwrap();
        let mut reader = MemReader::from_slice("mem", &pool, b"xyz");

        let caller = BlockingWaiter::new();
        let caller_waiter = Arc::clone(&caller) as Arc<dyn AioWaiter>;
        let (result, lease) = reader.get_buffer(WaiterRef::Task(&caller_waiter));
        assert_eq!(result, AioResult::Wait);
        assert!(lease.is_none());

        drop(gate);
        assert!(caller.wait_timeout(Duration::from_secs(1)));

        let (result, lease) = reader.get_buffer(WaiterRef::Task(&caller_waiter));
        assert_eq!(result, AioResult::Ok);
        assert_eq!(lease.unwrap().readable(), b"xyz");
    }

    #[test]
    fn zero_copy_view_shares_the_region() {
        let pool = pool(1, 64);
        let data = Bytes::from_static(b"static region");
        let factory = MemReaderFactory::from_bytes("view", data.clone());
        let mut reader = factory.open(&pool, 0, NOSIZE, 0).unwrap();
        assert_eq!(drain(reader.as_mut()), b"static region");
        // The factory still holds the same region.
        assert_eq!(factory.size(), data.len() as u64);
    }

    #[test]
    fn close_is_idempotent() {
        let pool = pool(1, 64);
        let mut reader = MemReader::from_slice("mem", &pool, b"abc");
        reader.close();
        reader.close();
    }
}
