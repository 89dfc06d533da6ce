//! Non-owning views over the slabs carved from a pool region.

use std::fmt;
use std::ptr::NonNull;
use std::slice;

/// A non-owning view over one fixed slab of pool memory.
///
/// The buffer tracks a read offset and a fill offset within the slab:
/// producers [`append`](Self::append) (or write through
/// [`writable`](Self::writable) and commit with
/// [`advance`](Self::advance)), consumers read through
/// [`readable`](Self::readable) and [`consume`](Self::consume). The
/// memory itself is owned by the pool the slab was carved from.
pub struct PoolBuffer {
    base: NonNull<u8>,
    capacity: usize,
    start: usize,
    end: usize,
}

// The pool guarantees each slab is referenced by at most one buffer view
// and keeps the backing region alive for as long as any view exists, so
// moving a view to another thread is sound.
unsafe impl Send for PoolBuffer {}

impl PoolBuffer {
    pub(crate) fn new(base: NonNull<u8>, capacity: usize) -> Self {
        Self {
            base,
            capacity,
            start: 0,
            end: 0,
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Number of unconsumed bytes currently in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` if no unconsumed bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Total capacity of the underlying slab in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The unconsumed bytes.
    #[must_use]
    pub fn readable(&self) -> &[u8] {
        // Everything in start..end was previously written through
        // `append` or `writable`/`advance`.
        unsafe { slice::from_raw_parts(self.base.as_ptr().add(self.start), self.len()) }
    }

    /// Writable tail of the slab, at most `max` bytes long.
    ///
    /// Bytes written here become readable once committed with
    /// [`advance`](Self::advance).
    pub fn writable(&mut self, max: usize) -> &mut [u8] {
        let n = max.min(self.capacity - self.end);
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(self.end), n) }
    }

    /// Commits `n` bytes previously written through
    /// [`writable`](Self::writable).
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the remaining slab capacity.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.capacity - self.end, "advance past buffer capacity");
        self.end += n;
    }

    /// Appends `data` to the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `data` does not fit in the remaining slab capacity.
    pub fn append(&mut self, data: &[u8]) {
        let dst = self.writable(data.len());
        assert!(dst.len() == data.len(), "append past buffer capacity");
        dst.copy_from_slice(data);
        self.end += data.len();
    }

    /// Marks the first `n` unconsumed bytes as consumed.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`len`](Self::len).
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len(), "consume past buffer contents");
        self.start += n;
    }

    /// Discards all contents, returning the buffer to its pristine state.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("capacity", &self.capacity)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}
