//! Single-shot, multi-subscriber promise settled through a dispatcher.
//!
//! A promise settles exactly once: the first of fulfill/reject wins and the
//! loser is a no-op. Subscriber callbacks never run inline with settlement
//! or with subscription, they are always queued on the dispatcher. The
//! terminal result is retained, so subscribing after settlement still fires
//! (asynchronously) with the stored value or error. Dropping both
//! settlement capabilities without using them rejects the promise with a
//! terminal error, so an abandoned operation never leaves waiters blocked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::dispatch::worker::Dispatcher;
use crate::error::Error;

const INVALID_EXECUTOR: &str = "Invalid Executor Callback.";
const PROMISE_ENDED: &str = "Promise ended.";

type FulfilledFn<T> = Box<dyn FnOnce(T) + Send>;
type RejectedFn = Box<dyn FnOnce(Error) + Send>;
type FinallyFn = Box<dyn FnOnce() + Send>;

enum State<T> {
    Pending {
        on_fulfilled: Vec<FulfilledFn<T>>,
        on_rejected: Vec<RejectedFn>,
        on_finally: Vec<FinallyFn>,
    },
    Fulfilled(T),
    Rejected(Error),
}

impl<T> State<T> {
    fn pending() -> Self {
        State::Pending {
            on_fulfilled: Vec::new(),
            on_rejected: Vec::new(),
            on_finally: Vec::new(),
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
    settling: AtomicBool,
    dispatcher: Dispatcher,
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn fulfill(inner: Arc<Self>, value: T) {
        if inner.settling.swap(true, Ordering::AcqRel) {
            return;
        }
        let dispatcher = inner.dispatcher.clone();
        dispatcher.call(move || {
            let (fulfilled, finally) = {
                let mut state = inner.state.lock();
                match std::mem::replace(&mut *state, State::Fulfilled(value.clone())) {
                    State::Pending {
                        on_fulfilled,
                        on_finally,
                        ..
                    } => (on_fulfilled, on_finally),
                    // The settling gate makes a second transition impossible.
                    other => {
                        *state = other;
                        return;
                    }
                }
            };
            inner.completed.notify_all();
            debug!(subscribers = fulfilled.len(), "promise fulfilled");
            for callback in fulfilled {
                callback(value.clone());
            }
            for callback in finally {
                callback();
            }
        });
    }

    fn reject(inner: Arc<Self>, error: Error) {
        if inner.settling.swap(true, Ordering::AcqRel) {
            return;
        }
        let dispatcher = inner.dispatcher.clone();
        dispatcher.call(move || {
            let (rejected, finally) = {
                let mut state = inner.state.lock();
                match std::mem::replace(&mut *state, State::Rejected(error.clone())) {
                    State::Pending {
                        on_rejected,
                        on_finally,
                        ..
                    } => (on_rejected, on_finally),
                    other => {
                        *state = other;
                        return;
                    }
                }
            };
            inner.completed.notify_all();
            debug!(subscribers = rejected.len(), error = %error, "promise rejected");
            for callback in rejected {
                callback(error.clone());
            }
            for callback in finally {
                callback();
            }
        });
    }
}

/// Shared by the resolver/rejecter pair. If both die without settling (a
/// spawned engine future dropped mid-flight, say), the last drop rejects
/// with the terminal error instead of stranding waiters on a promise that
/// can never settle.
struct SettleGuard<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> Drop for SettleGuard<T> {
    fn drop(&mut self) {
        // No-op when a capability already settled; the gate in
        // fulfill/reject swallows this.
        Inner::reject(self.inner.clone(), Error::new(PROMISE_ENDED));
    }
}

/// Fulfills the promise it was created from. Consumed on use; the first of
/// resolver/rejecter wins.
pub struct Resolver<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
    _guard: Arc<SettleGuard<T>>,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    pub fn resolve(self, value: T) {
        Inner::fulfill(self.inner.clone(), value);
    }
}

/// Rejects the promise it was created from.
pub struct Rejecter<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
    _guard: Arc<SettleGuard<T>>,
}

impl<T: Clone + Send + 'static> Rejecter<T> {
    pub fn reject(self, error: Error) {
        Inner::reject(self.inner.clone(), error);
    }
}

/// Shared handle to a single-shot asynchronous result.
pub struct Promise<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Creates a promise and immediately runs `executor` on the calling
    /// thread, handing it the settlement capabilities.
    pub fn new(
        dispatcher: &Dispatcher,
        executor: impl FnOnce(Resolver<T>, Rejecter<T>),
    ) -> Self {
        let promise = Self::pending(dispatcher);
        let guard = Arc::new(SettleGuard {
            inner: promise.inner.clone(),
        });
        executor(
            Resolver {
                inner: promise.inner.clone(),
                _guard: guard.clone(),
            },
            Rejecter {
                inner: promise.inner.clone(),
                _guard: guard,
            },
        );
        promise
    }

    /// Creates a promise that is already being rejected for lack of an
    /// executor. The rejection is delivered asynchronously like any other.
    pub fn without_executor(dispatcher: &Dispatcher) -> Self {
        let promise = Self::pending(dispatcher);
        Inner::reject(promise.inner.clone(), Error::new(INVALID_EXECUTOR));
        promise
    }

    fn pending(dispatcher: &Dispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::pending()),
                completed: Condvar::new(),
                settling: AtomicBool::new(false),
                dispatcher: dispatcher.clone(),
            }),
        }
    }

    /// Subscribes to fulfillment. Runs on the dispatcher, in registration
    /// order, at most once.
    pub fn then(&self, callback: impl FnOnce(T) + Send + 'static) -> &Self {
        let stored = {
            let mut state = self.inner.state.lock();
            if let State::Pending { on_fulfilled, .. } = &mut *state {
                on_fulfilled.push(Box::new(callback));
                return self;
            }
            match &*state {
                State::Fulfilled(value) => Some(value.clone()),
                _ => None,
            }
        };
        if let Some(value) = stored {
            self.inner.dispatcher.call(move || callback(value));
        }
        self
    }

    /// Subscribes to rejection.
    pub fn catch(&self, callback: impl FnOnce(Error) + Send + 'static) -> &Self {
        let stored = {
            let mut state = self.inner.state.lock();
            if let State::Pending { on_rejected, .. } = &mut *state {
                on_rejected.push(Box::new(callback));
                return self;
            }
            match &*state {
                State::Rejected(error) => Some(error.clone()),
                _ => None,
            }
        };
        if let Some(error) = stored {
            self.inner.dispatcher.call(move || callback(error));
        }
        self
    }

    /// Subscribes to settlement either way. Runs after the then/catch
    /// callbacks of the same settlement.
    pub fn finally(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        {
            let mut state = self.inner.state.lock();
            if let State::Pending { on_finally, .. } = &mut *state {
                on_finally.push(Box::new(callback));
                return self;
            }
        }
        self.inner.dispatcher.call(callback);
        self
    }

    /// Blocks the calling thread until the promise settles.
    ///
    /// Must not be called on the dispatcher's own thread: the settlement
    /// continuation would be queued behind the caller forever.
    pub fn wait(&self) -> &Self {
        assert!(
            !self.inner.dispatcher.is_current(),
            "Promise::wait called on the dispatcher thread"
        );
        let mut state = self.inner.state.lock();
        while matches!(*state, State::Pending { .. }) {
            self.inner.completed.wait(&mut state);
        }
        self
    }

    /// Whether the promise has reached a terminal state.
    pub fn is_completed(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Pending { .. })
    }

    /// The stored fulfillment value, if settled that way.
    pub fn value(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The stored rejection error, if settled that way.
    pub fn error(&self) -> Option<Error> {
        match &*self.inner.state.lock() {
            State::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn manual() -> Dispatcher {
        Dispatcher::new("promise-test")
    }

    #[test]
    fn test_delivery_is_never_inline() {
        let dispatcher = manual();
        let delivered = Arc::new(AtomicBool::new(false));
        let flag = delivered.clone();
        let promise = Promise::new(&dispatcher, |resolver, _rejecter| {
            resolver.resolve(7u32);
        });
        promise.then(move |_| flag.store(true, Ordering::Release));
        // Settled and subscribed, but nothing pumped the dispatcher yet.
        assert!(!delivered.load(Ordering::Acquire));
        dispatcher.dispatch_events(false);
        assert!(delivered.load(Ordering::Acquire));
        assert_eq!(promise.value(), Some(7));
    }

    #[test]
    fn test_fulfilled_callbacks_run_in_registration_order() {
        let dispatcher = manual();
        let (tx, rx) = mpsc::channel();
        let promise = Promise::new(&dispatcher, |resolver, _| resolver.resolve(()));
        for i in 0..4 {
            let tx = tx.clone();
            promise.then(move |_| tx.send(i).unwrap());
        }
        dispatcher.dispatch_events(false);
        let order: Vec<i32> = rx.try_iter().collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_finally_runs_after_then() {
        let dispatcher = manual();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let promise = Promise::new(&dispatcher, |resolver, _| resolver.resolve(1u8));
        promise
            .finally(move || tx2.send("finally").unwrap())
            .then(move |_| tx.send("then").unwrap());
        dispatcher.dispatch_events(false);
        let order: Vec<_> = rx.try_iter().collect();
        assert_eq!(order, vec!["then", "finally"]);
    }

    #[test]
    fn test_rejection_runs_catch_and_finally_only() {
        let dispatcher = manual();
        let fulfilled = Arc::new(AtomicBool::new(false));
        let caught = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let promise: Promise<u32> = Promise::new(&dispatcher, |_, rejecter| {
            rejecter.reject(Error::new("engine exploded"));
        });
        let f1 = fulfilled.clone();
        let f2 = caught.clone();
        let f3 = finished.clone();
        promise
            .then(move |_| f1.store(true, Ordering::Release))
            .catch(move |err| {
                assert_eq!(err.message(), "engine exploded");
                f2.store(true, Ordering::Release);
            })
            .finally(move || f3.store(true, Ordering::Release));
        dispatcher.dispatch_events(false);
        assert!(!fulfilled.load(Ordering::Acquire));
        assert!(caught.load(Ordering::Acquire));
        assert!(finished.load(Ordering::Acquire));
    }

    #[test]
    fn test_concurrent_fulfill_and_reject_settle_once() {
        for _ in 0..50 {
            let dispatcher = manual();
            let deliveries = Arc::new(AtomicUsize::new(0));
            let (capability_tx, capability_rx) = mpsc::channel();
            let promise: Promise<u32> = Promise::new(&dispatcher, |resolver, rejecter| {
                capability_tx.send((resolver, rejecter)).unwrap();
            });
            let d1 = deliveries.clone();
            let d2 = deliveries.clone();
            promise
                .then(move |_| {
                    d1.fetch_add(1, Ordering::AcqRel);
                })
                .catch(move |_| {
                    d2.fetch_add(1, Ordering::AcqRel);
                });
            let (resolver, rejecter) = capability_rx.recv().unwrap();
            let t1 = thread::spawn(move || resolver.resolve(1));
            let t2 = thread::spawn(move || rejecter.reject(Error::new("no")));
            t1.join().unwrap();
            t2.join().unwrap();
            dispatcher.dispatch_events(false);
            assert_eq!(deliveries.load(Ordering::Acquire), 1);
            assert!(promise.value().is_some() ^ promise.error().is_some());
        }
    }

    #[test]
    fn test_late_subscription_fires_with_stored_result() {
        let dispatcher = manual();
        let promise = Promise::new(&dispatcher, |resolver, _| resolver.resolve(41u32));
        dispatcher.dispatch_events(false);
        assert!(promise.is_completed());

        let (tx, rx) = mpsc::channel();
        promise.then(move |value| tx.send(value).unwrap());
        // Still asynchronous: nothing fires until the dispatcher runs.
        assert!(rx.try_recv().is_err());
        dispatcher.dispatch_events(false);
        assert_eq!(rx.try_recv().unwrap(), 41);
    }

    #[test]
    fn test_terminal_error_retained_for_late_catch() {
        let dispatcher = manual();
        let promise: Promise<()> = Promise::new(&dispatcher, |_, rejecter| {
            rejecter.reject(Error::new("gone"));
        });
        dispatcher.dispatch_events(false);
        let (tx, rx) = mpsc::channel();
        promise.catch(move |err| tx.send(err.message().to_string()).unwrap());
        dispatcher.dispatch_events(false);
        assert_eq!(rx.try_recv().unwrap(), "gone");
    }

    #[test]
    fn test_without_executor_rejects_asynchronously() {
        let dispatcher = manual();
        let promise: Promise<u32> = Promise::without_executor(&dispatcher);
        assert!(!promise.is_completed());
        dispatcher.dispatch_events(false);
        assert_eq!(
            promise.error().map(|e| e.message().to_string()),
            Some("Invalid Executor Callback.".to_string())
        );
    }

    #[test]
    fn test_dropped_capabilities_reject_with_terminal_error() {
        let dispatcher = manual();
        let promise: Promise<u32> = Promise::new(&dispatcher, |_resolver, _rejecter| {
            // Both capabilities die here, unsettled.
        });
        assert!(!promise.is_completed());
        dispatcher.dispatch_events(false);
        assert_eq!(
            promise.error().map(|e| e.message().to_string()),
            Some("Promise ended.".to_string())
        );
    }

    #[test]
    fn test_wait_returns_after_capabilities_are_dropped() {
        let dispatcher = Dispatcher::spawn("promise-abandon").unwrap();
        let promise: Promise<u32> = Promise::new(&dispatcher, |_, _| {});
        promise.wait();
        assert_eq!(
            promise.error().map(|e| e.message().to_string()),
            Some("Promise ended.".to_string())
        );
        dispatcher.stop();
    }

    #[test]
    fn test_settled_promise_ignores_capability_drop() {
        let dispatcher = manual();
        let promise = Promise::new(&dispatcher, |resolver, _rejecter| {
            resolver.resolve(9u8);
        });
        dispatcher.dispatch_events(false);
        assert_eq!(promise.value(), Some(9));
        assert!(promise.error().is_none());
    }

    #[test]
    fn test_wait_blocks_until_settlement() {
        let dispatcher = Dispatcher::spawn("promise-wait").unwrap();
        let (capability_tx, capability_rx) = mpsc::channel();
        let promise: Promise<&'static str> = Promise::new(&dispatcher, |resolver, _| {
            capability_tx.send(resolver).unwrap();
        });
        let resolver = capability_rx.recv().unwrap();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            resolver.resolve("done");
        });
        promise.wait();
        assert_eq!(promise.value(), Some("done"));
        dispatcher.stop();
    }

    #[test]
    fn test_chaining_returns_the_same_promise() {
        let dispatcher = manual();
        let hits = Arc::new(AtomicUsize::new(0));
        let (h1, h2) = (hits.clone(), hits.clone());
        let promise = Promise::new(&dispatcher, |resolver, _| resolver.resolve(5u8));
        promise
            .then(move |_| {
                h1.fetch_add(1, Ordering::AcqRel);
            })
            .catch(|_| {})
            .finally(move || {
                h2.fetch_add(1, Ordering::AcqRel);
            });
        dispatcher.dispatch_events(false);
        assert_eq!(hits.load(Ordering::Acquire), 2);
    }
}
