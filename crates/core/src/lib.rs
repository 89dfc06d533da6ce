//! Buffer pool, leases and the waiter notification substrate.
//!
//! This crate provides the resource layer shared by all readers and
//! writers in the workspace:
//!
//! - [`BufferPool`] owns a fixed set of page-aligned buffers, carved out
//!   of one contiguous region that can optionally live in kernel-backed
//!   shared memory so leases can be handed to a child process.
//! - [`BufferLease`] conveys exclusive, temporary ownership of one
//!   [`PoolBuffer`]; dropping the lease returns the buffer and wakes one
//!   waiter.
//! - [`Waitable`] implements the cooperative notification protocol: a
//!   party that finds a resource unavailable registers a waiter and is
//!   signalled exactly once per registration when the resource frees up.
//!
//! # Design Principles
//!
//! 1. **Fixed capacity** - all memory is carved at construction; running
//!    out of buffers blocks cooperatively instead of allocating.
//! 2. **False-sharing avoidance** - buffers are page-aligned and
//!    separated by guard pages so hardware prefetch on one buffer never
//!    touches a neighbour owned by another thread or process.
//! 3. **Weak waiters** - waiter registrations never keep their target
//!    alive; a registration left behind by a dropped waiter is skipped.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

pub mod buffer;
pub mod error;
pub mod notify;
pub mod pool;
pub mod waitable;

#[cfg(unix)]
mod shm;
#[cfg(not(unix))]
#[path = "shm_stub.rs"]
mod shm;

pub use buffer::PoolBuffer;
pub use error::PoolError;
pub use notify::{BlockingWaiter, BufferEventQueue, SignalRelay};
pub use pool::{BufferLease, BufferPool, PoolBacking, PoolConfig, DEFAULT_BUFFER_SIZE};
#[cfg(unix)]
pub use pool::SharedMemoryInfo;
pub use waitable::{AioEventHandler, AioWaiter, Waitable, WaitableToken, WaiterRef};

/// Sentinel denoting an unknown or unlimited size.
pub const NOSIZE: u64 = u64::MAX;

/// Outcome of a pull or push operation on a reader, writer or pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AioResult {
    /// The operation made progress and may be repeated immediately.
    Ok,
    /// The resource is exhausted; retry only after the passed waiter has
    /// been signalled.
    Wait,
    /// The object has failed and can only be closed.
    Error,
}
