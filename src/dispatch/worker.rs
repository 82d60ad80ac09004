//! Worker dispatcher: a timed callback queue serviced by a dedicated
//! thread, or pumped manually by an embedder-owned loop.
//!
//! Scheduling is never synchronous while the dispatcher runs. `call` with
//! a zero delay from the dispatcher's own thread still defers until the
//! current entry returns. Entries always execute outside the queue lock,
//! so a running entry may schedule further entries freely. After `stop`
//! the queue has no servicer, so scheduling degrades to running the entry
//! on the scheduling thread.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::dispatch::queue::{EntryFn, TimerQueue};
use crate::error::{Error, Result};

type WakeFn = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    name: String,
    queue: Mutex<TimerQueue>,
    condvar: Condvar,
    running: AtomicBool,
    wake_hook: Mutex<Option<WakeFn>>,
    threaded: bool,
}

/// Cheap-clone handle to a dispatcher. All clones refer to the same queue
/// and worker.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Dispatcher>> = const { RefCell::new(None) };
}

/// Restores the previous thread-local dispatcher when dropped.
struct CurrentGuard {
    previous: Option<Dispatcher>,
}

impl CurrentGuard {
    fn set(dispatcher: Dispatcher) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(dispatcher)));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}

impl Dispatcher {
    /// Creates a dispatcher with a dedicated worker thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let dispatcher = Self::build(name.into(), true);
        let worker = dispatcher.clone();
        let handle = thread::Builder::new()
            .name(dispatcher.shared.name.clone())
            .spawn(move || worker.run())
            .map_err(|e| Error::new(format!("Failed to spawn dispatcher thread: {e}")))?;
        *dispatcher.thread.lock() = Some(handle);
        debug!(name = %dispatcher.shared.name, "dispatcher thread started");
        Ok(dispatcher)
    }

    /// Creates a threadless dispatcher. The embedder drives it with
    /// [`Dispatcher::dispatch_events`], typically woken by the hook set via
    /// [`Dispatcher::register_async_callback`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false)
    }

    fn build(name: String, threaded: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                queue: Mutex::new(TimerQueue::new()),
                condvar: Condvar::new(),
                running: AtomicBool::new(true),
                wake_hook: Mutex::new(None),
                threaded,
            }),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    /// The dispatcher currently executing an entry on this thread, if any.
    pub fn current() -> Option<Dispatcher> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Whether the calling thread is executing entries for this dispatcher.
    pub fn is_current(&self) -> bool {
        Self::current().is_some_and(|d| Arc::ptr_eq(&d.shared, &self.shared))
    }

    /// Queues a callback for execution as soon as possible. Never runs it
    /// inline.
    pub fn call(&self, callback: impl FnOnce() + Send + 'static) {
        self.schedule(Box::new(callback), 0);
    }

    /// Alias for [`Dispatcher::call`] matching the timer-style API.
    pub fn set_immediate(&self, callback: impl FnOnce() + Send + 'static) {
        self.schedule(Box::new(callback), 0);
    }

    /// Queues a callback to fire after `delay_ms` milliseconds. Negative
    /// delays are treated as zero.
    pub fn set_timeout(&self, callback: impl FnOnce() + Send + 'static, delay_ms: i64) {
        self.schedule(Box::new(callback), delay_ms);
    }

    fn schedule(&self, callback: EntryFn, delay_ms: i64) {
        {
            // The running check happens under the queue lock so an entry is
            // either pushed before the stop-time snapshot or handled below,
            // never stranded between the two.
            let mut queue = self.shared.queue.lock();
            if self.shared.running.load(Ordering::Acquire) {
                queue.push(callback, delay_ms);
                drop(queue);
                self.shared.condvar.notify_all();
                let hook = self.shared.wake_hook.lock().clone();
                if let Some(hook) = hook {
                    hook();
                }
                return;
            }
        }
        // Stopped: nothing services the queue anymore. The entry runs on
        // the scheduling thread, immediately, rather than being lost.
        let _guard = CurrentGuard::set(self.clone());
        callback();
    }

    /// Whether the dispatcher still queues entries. After [`Dispatcher::stop`]
    /// this is false and scheduled entries run on the scheduling thread.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Installs the wake hook, replacing any prior registration. The hook
    /// runs on the scheduling thread every time an entry is queued.
    pub fn register_async_callback(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.wake_hook.lock() = Some(Arc::new(hook));
    }

    /// Clears the wake hook.
    pub fn unregister_async_callback(&self) {
        *self.shared.wake_hook.lock() = None;
    }

    /// Executes due entries on the calling thread. With `forever` it keeps
    /// parking between batches until [`Dispatcher::stop`]. Returns whether
    /// entries remain queued.
    pub fn dispatch_events(&self, forever: bool) -> bool {
        let _guard = CurrentGuard::set(self.clone());
        loop {
            self.run_due();
            if !forever || !self.shared.running.load(Ordering::Acquire) {
                break;
            }
            let mut queue = self.shared.queue.lock();
            if !self.shared.running.load(Ordering::Acquire) {
                break;
            }
            match queue.next_fire_at() {
                Some(fire_at) if fire_at <= Instant::now() => {}
                Some(fire_at) => {
                    self.shared.condvar.wait_until(&mut queue, fire_at);
                }
                None => self.shared.condvar.wait(&mut queue),
            }
        }
        !self.shared.queue.lock().is_empty()
    }

    fn run_due(&self) {
        loop {
            let entry = self.shared.queue.lock().pop_due(Instant::now());
            match entry {
                Some(entry) => entry.run(),
                None => break,
            }
        }
    }

    /// Number of queued entries, due or not.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops the dispatcher. Every entry queued at the moment of the stop
    /// is executed before this returns (or before the worker thread exits,
    /// when called from an entry on the worker itself); entries scheduled
    /// afterwards run immediately on the thread that scheduled them.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            // A stop issued from a worker entry cannot join its own thread;
            // a later caller picks the handle up here.
            self.join_worker();
            return;
        }
        debug!(name = %self.shared.name, "dispatcher stopping");
        self.shared.condvar.notify_all();
        if self.shared.threaded {
            self.join_worker();
        } else {
            self.drain();
        }
    }

    fn join_worker(&self) {
        let handle = {
            let mut slot = self.thread.lock();
            match slot.take() {
                Some(handle) if thread::current().id() == handle.thread().id() => {
                    // The worker is stopping itself; park the handle for a
                    // caller on another thread to join later.
                    *slot = Some(handle);
                    None
                }
                other => other,
            }
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(&self) {
        let _guard = CurrentGuard::set(self.clone());
        'run: loop {
            let entry = {
                let mut queue = self.shared.queue.lock();
                loop {
                    if !self.shared.running.load(Ordering::Acquire) {
                        break 'run;
                    }
                    if let Some(entry) = queue.pop_due(Instant::now()) {
                        break entry;
                    }
                    match queue.next_fire_at() {
                        Some(fire_at) => {
                            self.shared.condvar.wait_until(&mut queue, fire_at);
                        }
                        None => self.shared.condvar.wait(&mut queue),
                    }
                }
            };
            entry.run();
        }
        self.drain();
    }

    /// Runs every entry queued at the moment of the call. A single snapshot:
    /// entries scheduled by the drained entries go through [`Dispatcher::call`]
    /// and run inline there, so a self-rearming entry cannot pin the drain.
    fn drain(&self) {
        let entries = self.shared.queue.lock().drain();
        if entries.is_empty() {
            return;
        }
        debug!(name = %self.shared.name, count = entries.len(), "draining queued entries");
        let _guard = CurrentGuard::set(self.clone());
        for entry in entries {
            entry.run();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.shared.name)
            .field("pending", &self.shared.queue.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_zero_delay_is_still_deferred() {
        let dispatcher = Dispatcher::spawn("test-deferred").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        dispatcher.call(move || {
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            inner.set_immediate(move || flag.store(true, Ordering::Release));
            // Still inside the current entry: the nested one must not have run.
            tx.send(ran.load(Ordering::Acquire)).unwrap();
        });
        assert!(!rx.recv_timeout(WAIT).unwrap());
        dispatcher.stop();
    }

    #[test]
    fn test_delays_fire_in_order() {
        let dispatcher = Dispatcher::spawn("test-order").unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        dispatcher.set_timeout(move || tx2.send("slow").unwrap(), 80);
        dispatcher.set_timeout(move || tx.send("fast").unwrap(), 10);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "fast");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "slow");
        dispatcher.stop();
    }

    #[test]
    fn test_equal_delays_fire_fifo() {
        let dispatcher = Dispatcher::spawn("test-fifo").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        let (done_tx, done_rx) = mpsc::channel();
        // Schedule from inside an entry so all pushes happen while the
        // worker is busy, giving identical effective readiness.
        dispatcher.call(move || {
            for i in 0..32 {
                let tx = tx.clone();
                inner.set_immediate(move || tx.send(i).unwrap());
            }
            done_tx.send(()).unwrap();
        });
        done_rx.recv_timeout(WAIT).unwrap();
        let order: Vec<i32> = (0..32).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, (0..32).collect::<Vec<_>>());
        dispatcher.stop();
    }

    #[test]
    fn test_nested_scheduling_does_not_deadlock() {
        let dispatcher = Dispatcher::spawn("test-nested").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        dispatcher.call(move || {
            let deeper = inner.clone();
            inner.call(move || {
                deeper.set_timeout(move || tx.send(()).unwrap(), 1);
            });
        });
        rx.recv_timeout(WAIT).unwrap();
        dispatcher.stop();
    }

    #[test]
    fn test_current_is_set_inside_entries_only() {
        let dispatcher = Dispatcher::spawn("test-current").unwrap();
        assert!(Dispatcher::current().is_none());
        assert!(!dispatcher.is_current());
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        dispatcher.call(move || {
            tx.send(inner.is_current()).unwrap();
        });
        assert!(rx.recv_timeout(WAIT).unwrap());
        dispatcher.stop();
    }

    #[test]
    fn test_stop_runs_pending_entries() {
        let dispatcher = Dispatcher::spawn("test-drain").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran = ran.clone();
            dispatcher.set_timeout(
                move || {
                    ran.fetch_add(1, Ordering::AcqRel);
                },
                60_000,
            );
        }
        dispatcher.stop();
        assert_eq!(ran.load(Ordering::Acquire), 5);
    }

    #[test]
    fn test_manual_dispatch_events() {
        let dispatcher = Dispatcher::new("test-manual");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            dispatcher.call(move || {
                ran.fetch_add(1, Ordering::AcqRel);
            });
        }
        assert_eq!(ran.load(Ordering::Acquire), 0);
        let remaining = dispatcher.dispatch_events(false);
        assert_eq!(ran.load(Ordering::Acquire), 3);
        assert!(!remaining);
        dispatcher.stop();
    }

    #[test]
    fn test_wake_hook_fires_on_schedule() {
        let dispatcher = Dispatcher::new("test-hook");
        let woken = Arc::new(AtomicUsize::new(0));
        let counter = woken.clone();
        dispatcher.register_async_callback(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        });
        dispatcher.call(|| {});
        dispatcher.call(|| {});
        assert_eq!(woken.load(Ordering::Acquire), 2);
        dispatcher.unregister_async_callback();
        dispatcher.call(|| {});
        assert_eq!(woken.load(Ordering::Acquire), 2);
        dispatcher.dispatch_events(false);
        dispatcher.stop();
    }

    #[test]
    fn test_stop_returns_despite_rearming_entry() {
        // The pacing idiom the media sources use: each run re-arms itself
        // unless the dispatcher has stopped.
        fn arm(dispatcher: Dispatcher, ticks: Arc<AtomicUsize>) {
            if !dispatcher.is_running() {
                return;
            }
            let next = dispatcher.clone();
            dispatcher.set_timeout(
                move || {
                    ticks.fetch_add(1, Ordering::AcqRel);
                    arm(next, ticks);
                },
                1,
            );
        }
        let dispatcher = Dispatcher::spawn("test-rearm").unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        arm(dispatcher.clone(), ticks.clone());
        thread::sleep(Duration::from_millis(25));
        dispatcher.stop();
        let settled = ticks.load(Ordering::Acquire);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(ticks.load(Ordering::Acquire), settled);
    }

    #[test]
    fn test_schedule_after_stop_runs_on_the_scheduling_thread() {
        let dispatcher = Dispatcher::new("test-post-stop");
        dispatcher.stop();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        dispatcher.call(move || flag.store(true, Ordering::Release));
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_from_worker_entry_joins_on_second_stop() {
        let dispatcher = Dispatcher::spawn("test-self-stop").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = dispatcher.clone();
        dispatcher.call(move || {
            inner.stop();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(WAIT).unwrap();
        // The first stop ran on the worker and parked its own handle; this
        // one joins it.
        dispatcher.stop();
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_manual_stop_drains_queue() {
        let dispatcher = Dispatcher::new("test-manual-drain");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        dispatcher.set_timeout(
            move || {
                counter.fetch_add(1, Ordering::AcqRel);
            },
            60_000,
        );
        dispatcher.stop();
        assert_eq!(ran.load(Ordering::Acquire), 1);
    }
}
