//! The threaded file reader.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use spool_core::{
    AioResult, AioWaiter, BufferLease, BufferPool, Waitable, WaitableToken, WaiterRef, NOSIZE,
};

use crate::error::OpenError;
use crate::reader::{AioReader, ReadWindow, ReaderFactory, SeekPlan};

/// Reads a file through a single background worker.
///
/// The worker leases buffers from the pool, fills them from the file
/// with the reader's lock released, and queues up to `max_buffers` of
/// them for the foreground to pull. Buffers are delivered in strictly
/// ascending file order.
pub struct FileReader {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    mtime: Option<SystemTime>,
    closed: bool,
}

struct Shared {
    name: String,
    pool: Arc<BufferPool>,
    waitable: Waitable,
    max_buffers: usize,
    cond: Condvar,
    file: Mutex<Option<File>>,
    state: Mutex<State>,
}

struct State {
    buffers: VecDeque<BufferLease>,
    window: ReadWindow,
    quit: bool,
}

// The pool signals the reader when a buffer frees up; all the worker
// needs is a wake-up.
impl AioWaiter for Shared {
    fn on_buffer_availability(&self, _source: WaitableToken) {
        let _state = self.state.lock().expect("reader state mutex poisoned");
        self.cond.notify_one();
    }
}

impl FileReader {
    /// Wraps an already opened file.
    ///
    /// `offset` and `size` select the initial window (`NOSIZE` reads to
    /// the end); `max_buffers` caps the queue of filled buffers (0 picks
    /// 1). Sources whose metadata does not report a regular file size
    /// are treated as unsized and cannot be repositioned.
    pub fn open(
        name: impl Into<String>,
        pool: &Arc<BufferPool>,
        file: File,
        offset: u64,
        size: u64,
        max_buffers: usize,
    ) -> Result<Self, OpenError> {
        let name = name.into();
        let metadata = file.metadata().map_err(|source| OpenError::Io {
            action: "stat",
            path: PathBuf::from(&name),
            source,
        })?;
        let max_size = if metadata.is_file() {
            metadata.len()
        } else {
            NOSIZE
        };
        let mtime = metadata.modified().ok();

        let shared = Arc::new(Shared {
            name,
            pool: Arc::clone(pool),
            waitable: Waitable::new(),
            max_buffers: max_buffers.max(1),
            cond: Condvar::new(),
            file: Mutex::new(Some(file)),
            state: Mutex::new(State {
                buffers: VecDeque::new(),
                window: ReadWindow::new(max_size),
                quit: false,
            }),
        });

        let mut reader = Self {
            shared,
            worker: None,
            mtime,
            closed: false,
        };
        if !reader.seek(offset, size) {
            let spawn_failed = reader.shared.state.lock().expect("reader state mutex poisoned").window.error;
            let name = reader.shared.name.clone();
            reader.close();
            return Err(if spawn_failed {
                OpenError::Worker { name }
            } else {
                OpenError::InvalidWindow { name, offset, size }
            });
        }
        Ok(reader)
    }

    fn pool_waiter(&self) -> Arc<dyn AioWaiter> {
        Arc::clone(&self.shared) as Arc<dyn AioWaiter>
    }

    fn stop_worker(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("reader state mutex poisoned");
            state.quit = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&mut self) -> bool {
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("spool-reader".into())
            .spawn(move || read_worker(shared))
        {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(err) => {
                tracing::warn!(name = %self.shared.name, %err, "could not spawn the reader worker");
                self.shared.state.lock().expect("reader state mutex poisoned").window.error = true;
                false
            }
        }
    }
}

impl AioReader for FileReader {
    fn get_buffer(&mut self, waiter: WaiterRef<'_>) -> (AioResult, Option<BufferLease>) {
        assert!(!self.closed, "get_buffer on a closed reader");
        let mut state = self.shared.state.lock().expect("reader state mutex poisoned");
        if state.buffers.is_empty() {
            if state.window.error {
                (AioResult::Error, None)
            } else if state.window.eof {
                (AioResult::Ok, None)
            } else {
                self.shared.waitable.add_waiter(waiter);
                (AioResult::Wait, None)
            }
        } else {
            let was_full = state.buffers.len() == self.shared.max_buffers;
            let lease = state.buffers.pop_front();
            if was_full {
                // The worker paused on a full queue; there is room now.
                self.shared.cond.notify_one();
            }
            state.window.get_buffer_called = true;
            (AioResult::Ok, lease)
        }
    }

    fn seek(&mut self, offset: u64, size: u64) -> bool {
        assert!(!self.closed, "seek on a closed reader");
        let plan = {
            let state = self.shared.state.lock().expect("reader state mutex poisoned");
            if state.window.error {
                return false;
            }
            let seekable = state.window.max_size != NOSIZE;
            state.window.check_seek(offset, size, seekable)
        };
        let (offset, size) = match plan {
            SeekPlan::Unchanged => return true,
            SeekPlan::Rejected => return false,
            SeekPlan::Apply { offset, size } => (offset, size),
        };

        self.stop_worker();
        let pool_waiter = self.pool_waiter();
        self.shared.pool.remove_waiter(WaiterRef::Task(&pool_waiter));
        self.shared.waitable.remove_waiters();

        // Leases must go home with the state lock released; the pool's
        // signal can call straight back into this reader.
        let drained: Vec<BufferLease> = {
            let mut state = self.shared.state.lock().expect("reader state mutex poisoned");
            let drained = state.buffers.drain(..).collect();
            state.window.apply_seek(offset, size);
            state.quit = false;
            drained
        };
        drop(drained);

        {
            let guard = self.shared.file.lock().expect("reader file mutex poisoned");
            let Some(file) = guard.as_ref() else {
                return false;
            };
            let mut file: &File = file;
            if file.seek(SeekFrom::Start(offset)).is_err() {
                return false;
            }
        }

        let at_eof = self.shared.state.lock().expect("reader state mutex poisoned").window.eof;
        if at_eof {
            // Nothing left to produce; leave the reader drained.
            true
        } else {
            self.spawn_worker()
        }
    }

    fn rewind(&mut self) -> bool {
        let (offset, size) = {
            let state = self.shared.state.lock().expect("reader state mutex poisoned");
            (state.window.start_offset, state.window.size)
        };
        self.seek(offset, size)
    }

    fn seekable(&self) -> bool {
        self.shared.state.lock().expect("reader state mutex poisoned").window.max_size != NOSIZE
    }

    fn size(&self) -> u64 {
        self.shared.state.lock().expect("reader state mutex poisoned").window.size
    }

    fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn error(&self) -> bool {
        self.shared.state.lock().expect("reader state mutex poisoned").window.error
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop_worker();
        let pool_waiter = self.pool_waiter();
        self.shared.pool.remove_waiter(WaiterRef::Task(&pool_waiter));
        self.shared.waitable.remove_waiters();
        let drained: Vec<BufferLease> = {
            let mut state = self.shared.state.lock().expect("reader state mutex poisoned");
            state.buffers.drain(..).collect()
        };
        drop(drained);
        let _ = self.shared.file.lock().expect("reader file mutex poisoned").take();
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_chunk(shared: &Shared, lease: &mut BufferLease, want: usize) -> io::Result<usize> {
    if want == 0 {
        return Ok(0);
    }
    let guard = shared.file.lock().expect("reader file mutex poisoned");
    let Some(file) = guard.as_ref() else {
        return Ok(0);
    };
    let mut file: &File = file;
    let n = file.read(lease.writable(want))?;
    lease.advance(n);
    Ok(n)
}

fn read_worker(shared: Arc<Shared>) {
    let waiter = Arc::clone(&shared) as Arc<dyn AioWaiter>;
    let mut state = shared.state.lock().expect("reader state mutex poisoned");
    loop {
        if state.quit || state.window.error {
            return;
        }
        if state.buffers.len() >= shared.max_buffers {
            state = shared.cond.wait(state).expect("reader state mutex poisoned");
            continue;
        }
        let Some(mut lease) = BufferPool::get_buffer(&shared.pool, WaiterRef::Task(&waiter)) else {
            // Registered on the pool; its signal wakes us.
            state = shared.cond.wait(state).expect("reader state mutex poisoned");
            continue;
        };

        let mut aborted = false;
        while lease.len() < lease.capacity() {
            let mut want = lease.capacity() - lease.len();
            if state.window.remaining != NOSIZE {
                want = want.min(usize::try_from(state.window.remaining).unwrap_or(usize::MAX));
            }
            drop(state);
            let result = read_chunk(&shared, &mut lease, want);
            state = shared.state.lock().expect("reader state mutex poisoned");
            if state.quit || state.window.error {
                aborted = true;
                break;
            }
            match result {
                Err(err) => {
                    tracing::debug!(name = %shared.name, %err, "read failed");
                    state.window.error = true;
                    break;
                }
                Ok(0) => {
                    if state.window.remaining != 0 && state.window.remaining != NOSIZE {
                        tracing::debug!(
                            name = %shared.name,
                            remaining = state.window.remaining,
                            "source ended before the requested window"
                        );
                        state.window.error = true;
                    } else {
                        state.window.eof = true;
                    }
                    break;
                }
                Ok(n) => {
                    if state.window.remaining != NOSIZE {
                        state.window.remaining -= n as u64;
                    }
                }
            }
        }

        let done = state.window.eof || state.window.error;
        if aborted || lease.is_empty() {
            // Return the buffer with the lock released; the pool's
            // signal can call straight back into this reader.
            let fifo_empty = state.buffers.is_empty();
            drop(state);
            drop(lease);
            if aborted {
                return;
            }
            if done {
                if fifo_empty {
                    shared.waitable.signal_availability();
                }
                return;
            }
            state = shared.state.lock().expect("reader state mutex poisoned");
        } else {
            state.buffers.push_back(lease);
            if state.buffers.len() == 1 {
                shared.waitable.signal_availability();
            }
            if done {
                // The queue holds the tail of the window; the consumer
                // drains it and then observes eof or the error directly.
                return;
            }
        }
    }
}

/// Factory for [`FileReader`]s over a path.
#[derive(Clone, Debug)]
pub struct FileReaderFactory {
    path: PathBuf,
    name: String,
}

impl FileReaderFactory {
    /// Creates a factory reading from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    /// The path this factory opens.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReaderFactory for FileReaderFactory {
    fn clone_box(&self) -> Box<dyn ReaderFactory> {
        Box::new(self.clone())
    }

    fn open(
        &self,
        pool: &Arc<BufferPool>,
        offset: u64,
        size: u64,
        max_buffers: usize,
    ) -> Result<Box<dyn AioReader>, OpenError> {
        let max_buffers = if max_buffers == 0 {
            self.preferred_buffer_count()
        } else {
            max_buffers
        };
        let file = File::open(&self.path).map_err(|source| OpenError::Io {
            action: "open",
            path: self.path.clone(),
            source,
        })?;
        let reader = FileReader::open(self.name.clone(), pool, file, offset, size, max_buffers)?;
        Ok(Box::new(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => NOSIZE,
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn multiple_buffer_usage(&self) -> bool {
        true
    }

    fn preferred_buffer_count(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spool_core::{BlockingWaiter, PoolConfig};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pool(count: usize, size: usize) -> Arc<BufferPool> {
        BufferPool::with_config(PoolConfig {
            buffer_count: count,
            buffer_size: size,
            ..PoolConfig::default()
        })
        .unwrap()
    }

    fn drain(reader: &mut dyn AioReader) -> Result<Vec<u8>, ()> {
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
        let mut out = Vec::new();
        loop {
            match reader.get_buffer(WaiterRef::Task(&waiter)) {
                (AioResult::Wait, _) => {
                    assert!(blocking.wait_timeout(Duration::from_secs(10)), "stalled");
                }
                (AioResult::Error, _) => return Err(()),
                (AioResult::Ok, None) => return Ok(out),
                (AioResult::Ok, Some(lease)) => out.extend_from_slice(lease.readable()),
            }
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn reads_whole_file_in_order() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let path = write_file(&dir, "input.bin", &data);

        let pool = pool(4, 4096);
        let factory = FileReaderFactory::new(&path);
        let mut reader = factory.open(&pool, 0, NOSIZE, 0).unwrap();

        assert_eq!(drain(reader.as_mut()).unwrap(), data);
        reader.close();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn bounded_window_delivers_exact_range() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "input.bin", b"ABCDEFGHIJ");

        let pool = pool(1, 512);
        let factory = FileReaderFactory::new(&path);
        let mut reader = factory.open(&pool, 3, 4, 1).unwrap();
        assert_eq!(reader.size(), 4);

        assert_eq!(drain(reader.as_mut()).unwrap(), b"DEFG");
    }

    #[test]
    fn empty_file_reports_eof_immediately() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "empty.bin", b"");

        let pool = pool(1, 512);
        let mut reader = FileReaderFactory::new(&path).open(&pool, 0, NOSIZE, 1).unwrap();

        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
        let (result, lease) = reader.get_buffer(WaiterRef::Task(&waiter));
        assert_eq!(result, AioResult::Ok);
        assert!(lease.is_none());
    }

    #[test]
    fn window_past_the_file_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "short.bin", b"12345");

        let pool = pool(1, 512);
        let err = match FileReaderFactory::new(&path).open(&pool, 0, 10, 1) {
            Ok(_) => panic!("expected open to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, OpenError::InvalidWindow { .. }));
    }

    #[test]
    fn shrinking_source_is_a_premature_eof() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "shrink.bin", &[7u8; 4096]);

        let pool = pool(1, 1024);
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;

        // Park the worker on a dry pool, then shrink the file under it.
        let gate = BufferPool::get_buffer(&pool, WaiterRef::Task(&waiter)).unwrap();
        let mut reader = FileReaderFactory::new(&path).open(&pool, 0, NOSIZE, 1).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(100)
            .unwrap();
        drop(gate);

        let result = drain(reader.as_mut());
        assert!(result.is_err());
        assert!(reader.error());
    }

    #[test]
    fn rewind_replays_the_window() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "input.bin", b"HELLO");

        let pool = pool(2, 64);
        let mut reader = FileReaderFactory::new(&path).open(&pool, 0, NOSIZE, 2).unwrap();

        assert_eq!(drain(reader.as_mut()).unwrap(), b"HELLO");
        assert!(reader.rewind());
        assert_eq!(drain(reader.as_mut()).unwrap(), b"HELLO");
    }

    #[test]
    fn seek_moves_the_window() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "input.bin", b"ABCDEFGHIJ");

        let pool = pool(2, 64);
        let mut reader = FileReaderFactory::new(&path).open(&pool, 0, NOSIZE, 2).unwrap();
        assert_eq!(drain(reader.as_mut()).unwrap(), b"ABCDEFGHIJ");

        assert!(reader.seek(6, 3));
        assert_eq!(drain(reader.as_mut()).unwrap(), b"GHI");

        assert!(!reader.seek(6, 5));
    }

    #[test]
    fn close_is_idempotent_and_returns_buffers() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "input.bin", &[3u8; 8192]);

        let pool = pool(2, 512);
        let mut reader = FileReaderFactory::new(&path).open(&pool, 0, NOSIZE, 2).unwrap();

        // Let the worker queue something up, then tear down.
        let blocking = BlockingWaiter::new();
        let waiter = Arc::clone(&blocking) as Arc<dyn AioWaiter>;
        loop {
            match reader.get_buffer(WaiterRef::Task(&waiter)) {
                (AioResult::Wait, _) => {
                    assert!(blocking.wait_timeout(Duration::from_secs(10)));
                }
                _ => break,
            }
        }
        reader.close();
        reader.close();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn factory_reports_metadata() {
        let dir = tempdir().unwrap();
        let path = write_file(&dir, "meta.bin", b"123456");

        let factory = FileReaderFactory::new(&path);
        assert_eq!(factory.size(), 6);
        assert!(factory.seekable());
        assert!(factory.mtime().is_some());
        assert_eq!(factory.preferred_buffer_count(), 4);

        let cloned = factory.clone_box();
        assert_eq!(cloned.name(), factory.name());
    }
}
