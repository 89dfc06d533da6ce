//! The threaded file writer.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use filetime::FileTime;

use spool_core::{AioResult, BufferLease, Waitable, WaiterRef};

use crate::error::OpenError;
use crate::writer::{AioWriter, ProgressFn, WriterFactory};

/// Behaviour switches for [`FileWriter`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileWriterOptions {
    /// Sync file contents to disk as part of finalize.
    pub fsync: bool,
}

/// Writes a file through a single background worker.
///
/// Accepted leases drain to the file in exactly the order they were
/// added; the worker holds the writer's lock except during the actual
/// `write` calls. Closing without finalizing removes a file nothing was
/// ever written to, and truncates away any preallocated tail.
pub struct FileWriter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    path: PathBuf,
    closed: bool,
}

struct Shared {
    name: String,
    fsync: bool,
    max_buffers: usize,
    waitable: Waitable,
    cond: Condvar,
    file: Mutex<Option<File>>,
    state: Mutex<State>,
}

struct State {
    buffers: VecDeque<BufferLease>,
    // A lease the worker took out of the queue still counts against
    // max_buffers until fully drained.
    writing: bool,
    quit: bool,
    error: bool,
    // 0 running, 1 drain requested, 2 drained.
    finalizing: u8,
    preallocated: bool,
    pos: u64,
    progress: Option<ProgressFn>,
}

impl FileWriter {
    /// Wraps an already opened and positioned file.
    ///
    /// `pos` is the file position writing starts at (the open offset);
    /// `max_buffers` caps the queue of pending buffers (0 picks 1). The
    /// worker thread is started immediately.
    pub fn open(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        file: File,
        options: FileWriterOptions,
        progress: Option<ProgressFn>,
        pos: u64,
        max_buffers: usize,
    ) -> Result<Self, OpenError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name,
            fsync: options.fsync,
            max_buffers: max_buffers.max(1),
            waitable: Waitable::new(),
            cond: Condvar::new(),
            file: Mutex::new(Some(file)),
            state: Mutex::new(State {
                buffers: VecDeque::new(),
                writing: false,
                quit: false,
                error: false,
                finalizing: 0,
                preallocated: false,
                pos,
                progress,
            }),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("spool-writer".into())
                .spawn(move || write_worker(shared))
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(name = %shared.name, %err, "could not spawn the writer worker");
                return Err(OpenError::Worker {
                    name: shared.name.clone(),
                });
            }
        };

        Ok(Self {
            shared,
            worker: Some(worker),
            path: path.into(),
            closed: false,
        })
    }
}

impl AioWriter for FileWriter {
    fn add_buffer(&mut self, lease: BufferLease, waiter: WaiterRef<'_>) -> AioResult {
        assert!(!self.closed, "add_buffer on a closed writer");
        let mut state = self.shared.state.lock().expect("writer state mutex poisoned");
        if state.error || state.finalizing != 0 {
            drop(state);
            drop(lease);
            return AioResult::Error;
        }
        if lease.is_empty() {
            drop(state);
            drop(lease);
            return AioResult::Ok;
        }
        state.buffers.push_back(lease);
        if state.buffers.len() == 1 {
            self.shared.cond.notify_one();
        }
        if state.buffers.len() + usize::from(state.writing) >= self.shared.max_buffers {
            self.shared.waitable.add_waiter(waiter);
            AioResult::Wait
        } else {
            AioResult::Ok
        }
    }

    fn finalize(&mut self, waiter: WaiterRef<'_>) -> AioResult {
        assert!(!self.closed, "finalize on a closed writer");
        let mut state = self.shared.state.lock().expect("writer state mutex poisoned");
        if state.error {
            return AioResult::Error;
        }
        if state.finalizing == 2 {
            return AioResult::Ok;
        }
        state.finalizing = 1;
        if state.buffers.is_empty() && !state.writing {
            if self.shared.fsync {
                // The worker performs the sync and signals completion.
                self.shared.cond.notify_one();
            } else {
                state.finalizing = 2;
                return AioResult::Ok;
            }
        }
        self.shared.waitable.add_waiter(waiter);
        AioResult::Wait
    }

    fn preallocate(&mut self, size: u64) -> AioResult {
        assert!(!self.closed, "preallocate on a closed writer");
        let mut state = self.shared.state.lock().expect("writer state mutex poisoned");
        if state.error || !state.buffers.is_empty() || state.writing || state.finalizing != 0 {
            return AioResult::Error;
        }
        tracing::debug!(name = %self.shared.name, size, "preallocating output file");

        let guard = self.shared.file.lock().expect("writer file mutex poisoned");
        let Some(file) = guard.as_ref() else {
            return AioResult::Error;
        };
        if let Err(err) = preallocate_file(file, state.pos, size) {
            // Preallocation is advisory.
            tracing::warn!(name = %self.shared.name, %err, "could not preallocate the file");
        }
        drop(guard);
        state.preallocated = true;
        AioResult::Ok
    }

    fn set_mtime(&mut self, mtime: SystemTime) -> bool {
        assert!(!self.closed, "set_mtime on a closed writer");
        let state = self.shared.state.lock().expect("writer state mutex poisoned");
        if state.error || state.finalizing != 2 {
            return false;
        }
        let guard = self.shared.file.lock().expect("writer file mutex poisoned");
        let Some(file) = guard.as_ref() else {
            return false;
        };
        filetime::set_file_handle_times(file, None, Some(FileTime::from_system_time(mtime)))
            .is_ok()
    }

    fn error(&self) -> bool {
        self.shared.state.lock().expect("writer state mutex poisoned").error
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut state = self.shared.state.lock().expect("writer state mutex poisoned");
            state.quit = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.shared.waitable.remove_waiters();
        let drained: Vec<BufferLease> = {
            let mut state = self.shared.state.lock().expect("writer state mutex poisoned");
            state.buffers.drain(..).collect()
        };
        drop(drained);

        let (finalizing, preallocated, pos) = {
            let state = self.shared.state.lock().expect("writer state mutex poisoned");
            (state.finalizing, state.preallocated, state.pos)
        };
        if let Some(file) = self.shared.file.lock().expect("writer file mutex poisoned").take() {
            if finalizing == 0 && pos == 0 {
                // Freshly created file to which nothing has been
                // written.
                drop(file);
                tracing::debug!(name = %self.shared.name, "removing never-written output file");
                let _ = fs::remove_file(&self.path);
            } else if preallocated {
                // Writing may have stopped short of the preallocated
                // length; never leave tail garbage behind.
                let _ = file.set_len(pos);
            }
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.close();
    }
}

fn write_chunk(shared: &Shared, lease: &BufferLease) -> io::Result<usize> {
    let guard = shared.file.lock().expect("writer file mutex poisoned");
    let Some(file) = guard.as_ref() else {
        return Err(io::Error::other("file already closed"));
    };
    let mut file: &File = file;
    file.write(lease.readable())
}

fn sync_file(shared: &Shared) -> io::Result<()> {
    let guard = shared.file.lock().expect("writer file mutex poisoned");
    let Some(file) = guard.as_ref() else {
        return Err(io::Error::other("file already closed"));
    };
    file.sync_all()
}

fn write_worker(shared: Arc<Shared>) {
    let mut state = shared.state.lock().expect("writer state mutex poisoned");
    loop {
        if state.quit || state.error {
            return;
        }
        if state.buffers.is_empty() {
            if state.finalizing == 1 {
                state.finalizing = 2;
                if shared.fsync {
                    if let Err(err) = sync_file(&shared) {
                        tracing::error!(name = %shared.name, %err, "could not sync to disk");
                        state.error = true;
                    }
                }
                shared.waitable.signal_availability();
                return;
            }
            state = shared.cond.wait(state).expect("writer state mutex poisoned");
            continue;
        }

        let mut lease = state.buffers.pop_front().unwrap();
        state.writing = true;
        let mut failed = false;
        let mut aborted = false;
        while !lease.is_empty() {
            drop(state);
            let result = write_chunk(&shared, &lease);
            state = shared.state.lock().expect("writer state mutex poisoned");
            if state.quit || state.error {
                aborted = true;
                break;
            }
            match result {
                Ok(n) if n > 0 => {
                    lease.consume(n);
                    state.pos += n as u64;
                    if let Some(progress) = state.progress.as_ref() {
                        progress(n as u64);
                    }
                }
                Ok(_) => {
                    state.error = true;
                    failed = true;
                    break;
                }
                Err(err) => {
                    tracing::debug!(name = %shared.name, %err, "write failed");
                    state.error = true;
                    failed = true;
                    break;
                }
            }
        }
        state.writing = false;
        let was_full = state.buffers.len() + 1 == shared.max_buffers;

        // The lease goes home with the lock released; the pool's signal
        // may run arbitrary reader callbacks.
        drop(state);
        drop(lease);
        if failed || was_full {
            // On failure this wakes a producer blocked on the full
            // queue so it can observe the error.
            shared.waitable.signal_availability();
        }
        if failed || aborted {
            return;
        }
        state = shared.state.lock().expect("writer state mutex poisoned");
    }
}

#[cfg(unix)]
fn preallocate_file(file: &File, pos: u64, len: u64) -> io::Result<()> {
    use rustix::fs::{fallocate, FallocateFlags};
    use rustix::io::Errno;

    if len == 0 {
        return Ok(());
    }
    match fallocate(file, FallocateFlags::empty(), pos, len) {
        Ok(()) => Ok(()),
        Err(Errno::OPNOTSUPP | Errno::NOSYS | Errno::INVAL) => file.set_len(pos + len),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
fn preallocate_file(file: &File, pos: u64, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    file.set_len(pos + len)
}

/// Factory for [`FileWriter`]s over a path.
#[derive(Clone, Debug)]
pub struct FileWriterFactory {
    path: PathBuf,
    name: String,
    options: FileWriterOptions,
}

impl FileWriterFactory {
    /// Creates a factory writing to `path` with default options.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, FileWriterOptions::default())
    }

    /// Creates a factory writing to `path`.
    pub fn with_options(path: impl Into<PathBuf>, options: FileWriterOptions) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            options,
        }
    }

    /// The path this factory opens.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WriterFactory for FileWriterFactory {
    fn clone_box(&self) -> Box<dyn WriterFactory> {
        Box::new(self.clone())
    }

    fn open(
        &self,
        offset: u64,
        progress: Option<ProgressFn>,
        max_buffers: usize,
    ) -> Result<Box<dyn AioWriter>, OpenError> {
        let max_buffers = if max_buffers == 0 {
            self.preferred_buffer_count()
        } else {
            max_buffers
        };

        let file = if offset > 0 {
            OpenOptions::new().write(true).open(&self.path)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path)
        }
        .map_err(|source| OpenError::Io {
            action: "open",
            path: self.path.clone(),
            source,
        })?;

        if offset > 0 {
            let mut f: &File = &file;
            f.seek(SeekFrom::Start(offset)).map_err(|source| OpenError::Io {
                action: "seek",
                path: self.path.clone(),
                source,
            })?;
            file.set_len(offset).map_err(|source| OpenError::Io {
                action: "truncate",
                path: self.path.clone(),
                source,
            })?;
        }

        let writer = FileWriter::open(
            self.name.clone(),
            self.path.clone(),
            file,
            self.options,
            progress,
            offset,
            max_buffers,
        )?;
        Ok(Box::new(writer))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn offsetable(&self) -> bool {
        true
    }

    fn size(&self) -> u64 {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => spool_core::NOSIZE,
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn set_mtime(&self, mtime: SystemTime) -> bool {
        filetime::set_file_mtime(&self.path, FileTime::from_system_time(mtime)).is_ok()
    }

    fn multiple_buffer_usage(&self) -> bool {
        true
    }

    fn preferred_buffer_count(&self) -> usize {
        4
    }
}
