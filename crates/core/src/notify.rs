//! Ready-made waiter implementations.
//!
//! Real applications typically integrate the notification protocol with
//! their own event loop by implementing
//! [`AioEventHandler`](crate::AioEventHandler). The types here cover the
//! remaining common cases: blocking a plain thread until a signal
//! arrives, consuming buffer events from a simple queue, and forwarding
//! a signal from one waitable to the waiters of another.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::waitable::{AioEventHandler, AioWaiter, Waitable, WaitableToken};

/// A direct waiter that parks the calling thread until signalled.
///
/// One signal satisfies one [`wait`](Self::wait); a signal that arrives
/// before the wait is not lost.
pub struct BlockingWaiter {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl BlockingWaiter {
    /// Creates a waiter with no pending signal.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Blocks until one availability signal has been delivered, then
    /// consumes it.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock().expect("waiter flag mutex poisoned");
        while !*signalled {
            signalled = self.cond.wait(signalled).expect("waiter flag mutex poisoned");
        }
        *signalled = false;
    }

    /// As [`wait`](Self::wait), but gives up after `timeout`. Returns
    /// `true` if a signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock().expect("waiter flag mutex poisoned");
        while !*signalled {
            let (guard, result) = self.cond.wait_timeout(signalled, timeout).expect("waiter flag mutex poisoned");
            signalled = guard;
            if result.timed_out() && !*signalled {
                return false;
            }
        }
        *signalled = false;
        true
    }
}

impl AioWaiter for BlockingWaiter {
    fn on_buffer_availability(&self, _source: WaitableToken) {
        let mut signalled = self.signalled.lock().expect("waiter flag mutex poisoned");
        *signalled = true;
        self.cond.notify_one();
    }
}

/// An event-handler waiter backed by a token queue.
///
/// Each posted buffer event carries the [`WaitableToken`] of its source;
/// [`next`](Self::next) blocks until one is available. Retraction drops
/// queued events from the given source, which keeps a removed waiter
/// from observing a stale signal.
pub struct BufferEventQueue {
    events: Mutex<VecDeque<WaitableToken>>,
    cond: Condvar,
}

impl BufferEventQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        })
    }

    /// Blocks until a buffer event arrives and returns its source.
    pub fn next(&self) -> WaitableToken {
        let mut events = self.events.lock().expect("event queue mutex poisoned");
        loop {
            if let Some(token) = events.pop_front() {
                return token;
            }
            events = self.cond.wait(events).expect("event queue mutex poisoned");
        }
    }

    /// Returns the next pending event source, if any.
    pub fn try_next(&self) -> Option<WaitableToken> {
        self.events.lock().expect("event queue mutex poisoned").pop_front()
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().expect("event queue mutex poisoned").len()
    }

    /// Returns `true` if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().expect("event queue mutex poisoned").is_empty()
    }
}

impl AioEventHandler for BufferEventQueue {
    fn post_buffer_event(&self, source: WaitableToken) {
        let mut events = self.events.lock().expect("event queue mutex poisoned");
        events.push_back(source);
        self.cond.notify_one();
    }

    fn retract_buffer_events(&self, source: WaitableToken) {
        self.events.lock().expect("event queue mutex poisoned").retain(|t| *t != source);
    }
}

/// Forwards an availability signal to this relay's own waiters.
///
/// Non-threaded readers use this to chain waits: when the pool runs dry
/// the reader registers its relay there, and the pool's signal is passed
/// straight on to whoever is waiting on the reader.
pub struct SignalRelay {
    waitable: Waitable,
}

impl SignalRelay {
    /// Creates a relay with no waiters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waitable: Waitable::new(),
        })
    }

    /// The relay's own waitable, where forwarded signals are delivered.
    #[must_use]
    pub fn waitable(&self) -> &Waitable {
        &self.waitable
    }
}

impl AioWaiter for SignalRelay {
    fn on_buffer_availability(&self, _source: WaitableToken) {
        self.waitable.signal_availability();
    }
}
