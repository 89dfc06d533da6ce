//! The fixed-capacity buffer pool and its leases.

use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::fd::BorrowedFd;

use crate::buffer::PoolBuffer;
use crate::error::PoolError;
use crate::shm::{self, ShmRegion};
use crate::waitable::{Waitable, WaiterRef};

/// Default size of one pool buffer (256 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Where the pool's memory region lives.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PoolBacking {
    /// A private heap allocation.
    #[default]
    Private,
    /// A kernel-backed shared memory object whose handle can be passed
    /// to a cooperating child process.
    Shared,
}

/// Construction parameters for a [`BufferPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of buffers carved from the region.
    pub buffer_count: usize,
    /// Requested size of each buffer; 0 picks
    /// [`DEFAULT_BUFFER_SIZE`]. Rounded up to the page size for layout
    /// purposes.
    pub buffer_size: usize,
    /// Backing storage for the region.
    pub backing: PoolBacking,
    /// Sandbox application group identifier used to namespace the shared
    /// memory object name where the platform requires it.
    pub application_group_id: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1,
            buffer_size: 0,
            backing: PoolBacking::Private,
            application_group_id: None,
        }
    }
}

enum Backing {
    Private { base: NonNull<u8>, layout: Layout },
    Shared(ShmRegion),
}

// The raw base pointer is only dereferenced through the slab views the
// pool hands out, which never overlap.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
    fn base(&self) -> NonNull<u8> {
        match self {
            Backing::Private { base, .. } => *base,
            Backing::Shared(region) => region.base(),
        }
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Private { base, layout } = self {
            unsafe { alloc::dealloc(base.as_ptr(), *layout) };
        }
    }
}

/// Information about a shared pool's memory mapping.
///
/// To hand buffer leases to a child process, pass the fd and total size
/// to the child, let it create its own mapping, and for each lease send
/// `(BufferLease::pool_offset, buffer length)`; the child resolves the
/// offset against its own base address. The parent keeps the lease alive
/// until the child signals completion.
///
/// Any process holding the fd has write access to every buffer in the
/// region, so never pass it to an untrusted child.
#[cfg(unix)]
pub struct SharedMemoryInfo<'a> {
    /// File descriptor backing the mapping; may be sent over a domain
    /// socket.
    pub fd: BorrowedFd<'a>,
    /// Base address of this process's mapping.
    pub base: *const u8,
    /// Total length of the region in bytes.
    pub len: usize,
}

/// A fixed set of page-aligned buffers leased out one at a time.
///
/// The region is carved at construction: every buffer is rounded up to
/// whole pages and separated from its neighbours (and the region edges)
/// by one guard page, so automatic hardware prefetch on one buffer never
/// pulls in cache lines another thread or process is writing.
///
/// Buffers are handed out as [`BufferLease`]s from a last-in-first-out
/// free list. When the pool is dry, [`get_buffer`](Self::get_buffer)
/// registers the caller's waiter and the next returned lease signals it.
pub struct BufferPool {
    free: Mutex<Vec<PoolBuffer>>,
    waitable: Waitable,
    backing: Backing,
    region_len: usize,
    buffer_count: usize,
    buffer_size: usize,
}

impl BufferPool {
    /// Creates a pool of `buffer_count` private buffers of the default
    /// size.
    pub fn new(buffer_count: usize) -> Result<Arc<Self>, PoolError> {
        Self::with_config(PoolConfig {
            buffer_count,
            ..PoolConfig::default()
        })
    }

    /// Creates a pool from an explicit configuration.
    pub fn with_config(config: PoolConfig) -> Result<Arc<Self>, PoolError> {
        if config.buffer_count == 0 {
            return Err(PoolError::InvalidConfig("buffer_count must be at least 1"));
        }
        let buffer_size = if config.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            config.buffer_size
        };

        let page = shm::page_size();
        let adjusted = buffer_size
            .checked_next_multiple_of(page)
            .ok_or(PoolError::InvalidConfig("buffer_size overflows the region"))?;
        let region_len = (adjusted + page)
            .checked_mul(config.buffer_count)
            .and_then(|v| v.checked_add(page))
            .ok_or(PoolError::InvalidConfig("buffer layout overflows the region"))?;

        let backing = match config.backing {
            PoolBacking::Shared => Backing::Shared(ShmRegion::create(
                region_len,
                config.application_group_id.as_deref(),
            )?),
            PoolBacking::Private => {
                let layout = Layout::from_size_align(region_len, page)
                    .map_err(|_| PoolError::InvalidConfig("buffer layout overflows the region"))?;
                let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
                    .ok_or(PoolError::Alloc { size: region_len })?;
                Backing::Private { base, layout }
            }
        };

        let base = backing.base();
        let stride = adjusted + page;
        let mut free = Vec::with_capacity(config.buffer_count);
        for i in 0..config.buffer_count {
            // One leading guard page, then buffers each followed by
            // their own guard page.
            let offset = page + i * stride;
            let slab = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            free.push(PoolBuffer::new(slab, buffer_size));
        }

        Ok(Arc::new(Self {
            free: Mutex::new(free),
            waitable: Waitable::new(),
            backing,
            region_len,
            buffer_count: config.buffer_count,
            buffer_size,
        }))
    }

    /// Leases one buffer, or registers `waiter` and returns `None` when
    /// the pool is dry.
    ///
    /// After a `None`, do not call again until the waiter has been
    /// signalled. When a buffer frees up and several waiters are
    /// registered, which one is signalled is unspecified.
    pub fn get_buffer(pool: &Arc<Self>, waiter: WaiterRef<'_>) -> Option<BufferLease> {
        let buffer = {
            let mut free = pool.free.lock().expect("buffer pool mutex poisoned");
            free.pop()
        };
        match buffer {
            Some(buffer) => Some(BufferLease {
                buffer: Some(buffer),
                pool: Arc::clone(pool),
            }),
            None => {
                pool.waitable.add_waiter(waiter);
                None
            }
        }
    }

    /// Removes a waiter previously registered through a dry
    /// [`get_buffer`](Self::get_buffer).
    pub fn remove_waiter(&self, waiter: WaiterRef<'_>) {
        self.waitable.remove_waiter(waiter);
    }

    fn release(&self, mut buffer: PoolBuffer) {
        buffer.clear();
        {
            let mut free = self.free.lock().expect("buffer pool mutex poisoned");
            free.push(buffer);
        }
        self.waitable.signal_availability();
    }

    /// Number of buffers currently idle in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().expect("buffer pool mutex poisoned").len()
    }

    /// Total number of buffers the pool owns.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Usable size of each buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Identity of the pool's waitable, as carried by posted buffer
    /// events.
    #[must_use]
    pub fn token(&self) -> crate::waitable::WaitableToken {
        self.waitable.token()
    }

    /// Describes the shared memory mapping backing this pool, or `None`
    /// for private pools.
    #[cfg(unix)]
    #[must_use]
    pub fn shared_memory_info(&self) -> Option<SharedMemoryInfo<'_>> {
        match &self.backing {
            Backing::Shared(region) => Some(SharedMemoryInfo {
                fd: region.fd(),
                base: region.base().as_ptr(),
                len: region.len(),
            }),
            Backing::Private { .. } => None,
        }
    }

    /// Total length of the backing region, including guard pages.
    #[must_use]
    pub fn region_len(&self) -> usize {
        self.region_len
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let free = match self.free.get_mut() {
            Ok(free) => free,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert!(
            free.len() == self.buffer_count,
            "buffer pool dropped with {} of {} buffers outstanding",
            self.buffer_count - free.len(),
            self.buffer_count
        );
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_count", &self.buffer_count)
            .field("buffer_size", &self.buffer_size)
            .field("region_len", &self.region_len)
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive, temporary ownership of one pool buffer.
///
/// The lease dereferences to its [`PoolBuffer`]. Dropping it discards
/// the contents and returns the buffer to the pool, which signals one
/// waiter. A lease must never outlive its pool; the pool's destructor
/// asserts that every buffer has come home.
pub struct BufferLease {
    buffer: Option<PoolBuffer>,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    /// Offset of this buffer's slab from the base of the pool region.
    ///
    /// Together with the mapping described by
    /// [`BufferPool::shared_memory_info`] this is what a parent sends to
    /// a child process to share the buffer.
    #[must_use]
    pub fn pool_offset(&self) -> u64 {
        let base = self.pool.backing.base().as_ptr() as usize;
        let slab = self.buffer.as_ref().expect("lease already released").base();
        (slab.as_ptr() as usize - base) as u64
    }
}

impl Deref for BufferLease {
    type Target = PoolBuffer;

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().expect("lease already released")
    }
}

impl DerefMut for BufferLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().expect("lease already released")
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.release(buffer);
        }
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("pool_offset", &self.pool_offset())
            .finish()
    }
}
