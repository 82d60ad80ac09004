//! Reference-counted handles with an explicit, exactly-once dispose step.
//!
//! Adapter objects that register themselves with the engine (sinks,
//! sources) must unregister before they can be released. `Handle` carries
//! that teardown as a first-class operation: `dispose` runs it exactly once
//! across every clone, and dropping the last clone without an explicit
//! dispose runs it as a backstop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Teardown side effects of a handle-managed object.
pub trait Dispose {
    fn dispose(&self);
}

struct Slot<T: Dispose> {
    value: T,
    disposed: AtomicBool,
}

impl<T: Dispose> Drop for Slot<T> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::Acquire) {
            self.value.dispose();
        }
    }
}

/// Shared owning handle. `Clone` shares one refcounted allocation; the
/// default value is empty.
pub struct Handle<T: Dispose> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T: Dispose> Handle<T> {
    pub fn new(value: T) -> Self {
        Self {
            slot: Some(Arc::new(Slot {
                value,
                disposed: AtomicBool::new(false),
            })),
        }
    }

    /// A handle referring to nothing.
    pub fn empty() -> Self {
        Self { slot: None }
    }

    /// Whether this handle refers to nothing. Distinguishes a
    /// default-constructed handle from a live one; other clones of a live
    /// handle remain non-empty after this one is disposed.
    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.slot.as_ref().map(|slot| &slot.value)
    }

    /// Runs the value's teardown exactly once across all clones and
    /// empties this handle. Subsequent calls anywhere are no-ops.
    pub fn dispose(&mut self) {
        if let Some(slot) = self.slot.take() {
            if !slot.disposed.swap(true, Ordering::AcqRel) {
                slot.value.dispose();
            }
        }
    }

    /// A non-owning back-reference. Upgrading yields an empty handle once
    /// the value is gone or disposed.
    pub fn downgrade(&self) -> WeakHandle<T> {
        WeakHandle {
            slot: self
                .slot
                .as_ref()
                .map(Arc::downgrade)
                .unwrap_or_default(),
        }
    }
}

impl<T: Dispose> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

impl<T: Dispose> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Dispose> Default for Handle<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Weak counterpart of [`Handle`].
pub struct WeakHandle<T: Dispose> {
    slot: Weak<Slot<T>>,
}

impl<T: Dispose> WeakHandle<T> {
    pub fn upgrade(&self) -> Handle<T> {
        match self.slot.upgrade() {
            Some(slot) if !slot.disposed.load(Ordering::Acquire) => Handle { slot: Some(slot) },
            _ => Handle::empty(),
        }
    }
}

impl<T: Dispose> Clone for WeakHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Dispose> Default for WeakHandle<T> {
    fn default() -> Self {
        Self { slot: Weak::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct TrackedTeardown {
        disposals: Arc<AtomicUsize>,
    }

    impl Dispose for TrackedTeardown {
        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn tracked() -> (Handle<TrackedTeardown>, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(TrackedTeardown {
            disposals: disposals.clone(),
        });
        (handle, disposals)
    }

    #[test]
    fn test_empty_handle_is_empty() {
        let handle: Handle<TrackedTeardown> = Handle::default();
        assert!(handle.is_empty());
        assert!(handle.get().is_none());
        let (live, _) = tracked();
        assert!(!live.is_empty());
        assert!(live.get().is_some());
    }

    #[test]
    fn test_dispose_runs_exactly_once_across_clones() {
        let (handle, disposals) = tracked();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let mut clone = handle.clone();
                thread::spawn(move || clone.dispose())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(disposals.load(Ordering::Acquire), 1);
        // Clones that didn't dispose still see the value.
        assert!(!handle.is_empty());
        drop(handle);
        assert_eq!(disposals.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_last_drop_backstops_dispose() {
        let (handle, disposals) = tracked();
        let clone = handle.clone();
        drop(handle);
        assert_eq!(disposals.load(Ordering::Acquire), 0);
        drop(clone);
        assert_eq!(disposals.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_weak_upgrade_fails_after_dispose() {
        let (mut handle, _) = tracked();
        let weak = handle.downgrade();
        assert!(!weak.upgrade().is_empty());
        handle.dispose();
        assert!(weak.upgrade().is_empty());
    }

    #[test]
    fn test_weak_upgrade_fails_after_last_drop() {
        let (handle, _) = tracked();
        let weak = handle.downgrade();
        drop(handle);
        assert!(weak.upgrade().is_empty());
    }
}
