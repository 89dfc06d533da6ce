//! The cooperative waiter/notification protocol.
//!
//! A [`Waitable`] is a resource that can temporarily run dry: a pool out
//! of free buffers, a reader with an empty queue, a writer with a full
//! one. Parties that hit the dry state register a waiter and are later
//! signalled exactly once per registration. Two waiter flavours exist:
//! direct callbacks ([`AioWaiter`]) invoked from whichever thread makes
//! the resource available, and event handlers ([`AioEventHandler`]) that
//! receive a posted buffer-available event instead.

use std::sync::{Arc, Mutex, Weak};
use std::thread;

/// Direct waiter callback.
///
/// Invoked from an unspecified thread. Implementations must only flag
/// and wake their own target; in particular they must never call back
/// into the waitable (or the pool) that is signalling them.
pub trait AioWaiter: Send + Sync {
    /// One registered availability signal has fired. `source` identifies
    /// the waitable that became available.
    fn on_buffer_availability(&self, source: WaitableToken);
}

/// Event-handler waiter.
///
/// Instead of a direct callback, the signal is delivered as a posted
/// buffer-available event that the handler's owner consumes from its own
/// loop. Handlers must also support retracting pending events from one
/// source, which removal of the waiter relies on.
pub trait AioEventHandler: Send + Sync {
    /// Enqueues a buffer-available event originating from `source`.
    fn post_buffer_event(&self, source: WaitableToken);

    /// Drops any pending buffer-available events originating from
    /// `source`.
    fn retract_buffer_events(&self, source: WaitableToken);
}

/// Identity of a [`Waitable`], carried by posted buffer events.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WaitableToken(usize);

/// Borrowed reference to either waiter flavour, as accepted by every
/// operation that may need to park its caller.
#[derive(Clone, Copy)]
pub enum WaiterRef<'a> {
    /// A direct callback waiter.
    Task(&'a Arc<dyn AioWaiter>),
    /// An event-handler waiter.
    Events(&'a Arc<dyn AioEventHandler>),
}

#[derive(Default)]
struct WaitState {
    waiters: Vec<Weak<dyn AioWaiter>>,
    handlers: Vec<Weak<dyn AioEventHandler>>,
    // Address of the waiter currently being signalled, 0 if none.
    signalling: usize,
}

/// An object that can be waited on.
///
/// Registrations are stored weakly; a registration whose waiter has been
/// dropped is skipped at signal time. Duplicate registrations are
/// permitted and each is an independent signal entitlement.
#[derive(Default)]
pub struct Waitable {
    state: Mutex<WaitState>,
}

fn waiter_addr(w: &Arc<dyn AioWaiter>) -> usize {
    Arc::as_ptr(w) as *const () as usize
}

fn handler_addr(h: &Arc<dyn AioEventHandler>) -> usize {
    Arc::as_ptr(h) as *const () as usize
}

impl Waitable {
    /// Creates a waitable with no registered waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of this waitable, as carried by posted buffer events.
    #[must_use]
    pub fn token(&self) -> WaitableToken {
        WaitableToken(self as *const Self as usize)
    }

    /// Registers a waiter. Each registration entitles the waiter to one
    /// signal.
    pub fn add_waiter(&self, waiter: WaiterRef<'_>) {
        let mut state = self.state.lock().expect("waiter list mutex poisoned");
        match waiter {
            WaiterRef::Task(w) => state.waiters.push(Arc::downgrade(w)),
            WaiterRef::Events(h) => state.handlers.push(Arc::downgrade(h)),
        }
    }

    /// Removes every registration of `waiter`.
    ///
    /// For a direct waiter this blocks (yielding) until a signal that is
    /// currently being delivered to it has returned; afterwards no
    /// callback for this waitable can reach the waiter. For an event
    /// handler the handler's pending buffer events from this waitable
    /// are retracted as well, since a signal may already have been
    /// posted.
    pub fn remove_waiter(&self, waiter: WaiterRef<'_>) {
        let mut state = self.state.lock().expect("waiter list mutex poisoned");
        match waiter {
            WaiterRef::Task(w) => {
                let target = waiter_addr(w);
                while state.signalling == target {
                    drop(state);
                    thread::yield_now();
                    state = self.state.lock().expect("waiter list mutex poisoned");
                }
                state
                    .waiters
                    .retain(|entry| entry.as_ptr() as *const () as usize != target);
            }
            WaiterRef::Events(h) => {
                let target = handler_addr(h);
                h.retract_buffer_events(self.token());
                state
                    .handlers
                    .retain(|entry| entry.as_ptr() as *const () as usize != target);
            }
        }
    }

    /// Removes every waiter of either flavour, retracting pending
    /// handler events, and waits out any in-flight signal.
    pub fn remove_waiters(&self) {
        let mut state = self.state.lock().expect("waiter list mutex poisoned");
        while state.signalling != 0 {
            drop(state);
            thread::yield_now();
            state = self.state.lock().expect("waiter list mutex poisoned");
        }
        state.waiters.clear();
        let token = self.token();
        for handler in state.handlers.drain(..) {
            if let Some(handler) = handler.upgrade() {
                handler.retract_buffer_events(token);
            }
        }
    }

    /// Signals at most one waiter that the resource has become
    /// available.
    ///
    /// The most recently registered live direct waiter wins; its
    /// callback runs with the internal lock released. Only when no live
    /// direct waiter exists is the most recently registered live handler
    /// posted a buffer event. Callers invoke this once per resource
    /// transition.
    pub fn signal_availability(&self) {
        let mut state = self.state.lock().expect("waiter list mutex poisoned");
        while let Some(entry) = state.waiters.pop() {
            let Some(waiter) = entry.upgrade() else {
                continue;
            };
            state.signalling = waiter_addr(&waiter);
            drop(state);
            waiter.on_buffer_availability(self.token());
            state = self.state.lock().expect("waiter list mutex poisoned");
            state.signalling = 0;
            return;
        }
        while let Some(entry) = state.handlers.pop() {
            let Some(handler) = entry.upgrade() else {
                continue;
            };
            handler.post_buffer_event(self.token());
            return;
        }
    }
}

impl Drop for Waitable {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        assert!(
            state.signalling == 0,
            "waitable dropped while a waiter is being signalled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWaiter {
        hits: AtomicUsize,
    }

    impl CountingWaiter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl AioWaiter for CountingWaiter {
        fn on_buffer_availability(&self, _source: WaitableToken) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct RecordingHandler {
        events: Mutex<Vec<WaitableToken>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl AioEventHandler for RecordingHandler {
        fn post_buffer_event(&self, source: WaitableToken) {
            self.events.lock().unwrap().push(source);
        }

        fn retract_buffer_events(&self, source: WaitableToken) {
            self.events.lock().unwrap().retain(|t| *t != source);
        }
    }

    #[test]
    fn one_signal_per_registration() {
        let waitable = Waitable::new();
        let waiter = CountingWaiter::new();
        let as_dyn: Arc<dyn AioWaiter> = waiter.clone();

        waitable.add_waiter(WaiterRef::Task(&as_dyn));
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 1);

        // The registration was consumed; further signals go nowhere.
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 1);
    }

    #[test]
    fn duplicate_registrations_each_fire() {
        let waitable = Waitable::new();
        let waiter = CountingWaiter::new();
        let as_dyn: Arc<dyn AioWaiter> = waiter.clone();

        waitable.add_waiter(WaiterRef::Task(&as_dyn));
        waitable.add_waiter(WaiterRef::Task(&as_dyn));
        waitable.signal_availability();
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 2);
    }

    #[test]
    fn last_registered_waiter_wins() {
        let waitable = Waitable::new();
        let first = CountingWaiter::new();
        let second = CountingWaiter::new();
        let first_dyn: Arc<dyn AioWaiter> = first.clone();
        let second_dyn: Arc<dyn AioWaiter> = second.clone();

        waitable.add_waiter(WaiterRef::Task(&first_dyn));
        waitable.add_waiter(WaiterRef::Task(&second_dyn));
        waitable.signal_availability();

        assert_eq!(first.hits(), 0);
        assert_eq!(second.hits(), 1);
    }

    #[test]
    fn removed_waiter_is_not_signalled() {
        let waitable = Waitable::new();
        let waiter = CountingWaiter::new();
        let as_dyn: Arc<dyn AioWaiter> = waiter.clone();

        waitable.add_waiter(WaiterRef::Task(&as_dyn));
        waitable.remove_waiter(WaiterRef::Task(&as_dyn));
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 0);
    }

    #[test]
    fn dropped_waiter_is_skipped() {
        let waitable = Waitable::new();
        let stale = CountingWaiter::new();
        let live = CountingWaiter::new();
        let stale_dyn: Arc<dyn AioWaiter> = stale.clone();
        let live_dyn: Arc<dyn AioWaiter> = live.clone();

        waitable.add_waiter(WaiterRef::Task(&live_dyn));
        waitable.add_waiter(WaiterRef::Task(&stale_dyn));
        drop(stale_dyn);
        drop(stale);

        waitable.signal_availability();
        assert_eq!(live.hits(), 1);
    }

    #[test]
    fn direct_waiters_take_precedence_over_handlers() {
        let waitable = Waitable::new();
        let waiter = CountingWaiter::new();
        let handler = RecordingHandler::new();
        let waiter_dyn: Arc<dyn AioWaiter> = waiter.clone();
        let handler_dyn: Arc<dyn AioEventHandler> = handler.clone();

        waitable.add_waiter(WaiterRef::Events(&handler_dyn));
        waitable.add_waiter(WaiterRef::Task(&waiter_dyn));
        waitable.signal_availability();

        assert_eq!(waiter.hits(), 1);
        assert!(handler.events.lock().unwrap().is_empty());

        waitable.signal_availability();
        assert_eq!(handler.events.lock().unwrap().as_slice(), &[waitable.token()]);
    }

    #[test]
    fn removing_handler_retracts_pending_events() {
        let waitable = Waitable::new();
        let handler = RecordingHandler::new();
        let handler_dyn: Arc<dyn AioEventHandler> = handler.clone();

        waitable.add_waiter(WaiterRef::Events(&handler_dyn));
        waitable.signal_availability();
        assert_eq!(handler.events.lock().unwrap().len(), 1);

        waitable.add_waiter(WaiterRef::Events(&handler_dyn));
        waitable.remove_waiter(WaiterRef::Events(&handler_dyn));
        assert!(handler.events.lock().unwrap().is_empty());

        // The registration is gone as well.
        waitable.signal_availability();
        assert!(handler.events.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_waiters_clears_both_flavours() {
        let waitable = Waitable::new();
        let waiter = CountingWaiter::new();
        let handler = RecordingHandler::new();
        let waiter_dyn: Arc<dyn AioWaiter> = waiter.clone();
        let handler_dyn: Arc<dyn AioEventHandler> = handler.clone();

        waitable.add_waiter(WaiterRef::Task(&waiter_dyn));
        waitable.add_waiter(WaiterRef::Events(&handler_dyn));
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 1);

        waitable.add_waiter(WaiterRef::Events(&handler_dyn));
        waitable.signal_availability();
        assert_eq!(handler.events.lock().unwrap().len(), 1);

        waitable.remove_waiters();
        assert!(handler.events.lock().unwrap().is_empty());
        waitable.signal_availability();
        assert_eq!(waiter.hits(), 1);
    }
}
