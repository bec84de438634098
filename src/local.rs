//! Fiber-local storage and the worker context switch.
//!
//! Every OS thread owns an ambient pair of keyed maps (plain and
//! inheritable) plus a current-fiber slot. [`FiberLocal`] and
//! [`InheritableFiberLocal`] are typed keys into those maps and work on
//! any thread; what makes them *fiber*-local is the context switch: on
//! slice entry the worker's ambient maps are swapped with the views
//! saved on the fiber, and slice exit performs the identical symmetric
//! swap. Lookups inside user code therefore address the fiber's state
//! without knowing whether they run on a fiber at all, and the worker's
//! own view is bit-for-bit untouched across a slice.
//!
//! The current-fiber slot is a typed per-thread cell, so a lookup can
//! always tell a worker running a fiber from a plain thread. Installing
//! a fiber over an occupied slot is a fatal structural error.
//!
//! Fibers constructed inside another fiber's slice snapshot the
//! inheritable view by value at construction, mirroring what inheritable
//! thread-locals do for kernel threads.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::fiber::Fiber;

/// The plain fiber-local view: key → erased value.
pub(crate) type LocalMap = HashMap<u64, Box<dyn Any + Send>>;

/// A value storable in the inheritable view; must be deep-copyable so
/// child fibers can snapshot it.
pub(crate) trait InheritableValue: Send {
    fn clone_boxed(&self) -> Box<dyn InheritableValue>;
    fn as_any_mut(&mut self) -> &mut (dyn Any + Send);
}

impl<T: Any + Send + Clone> InheritableValue for T {
    fn clone_boxed(&self) -> Box<dyn InheritableValue> {
        Box::new(self.clone())
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + Send) {
        self
    }
}

/// The inheritable fiber-local view.
#[derive(Default)]
pub(crate) struct InheritableMap {
    entries: HashMap<u64, Box<dyn InheritableValue>>,
}

impl InheritableMap {
    pub(crate) fn snapshot(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (*k, v.clone_boxed()))
                .collect(),
        }
    }
}

impl std::fmt::Debug for InheritableMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InheritableMap")
            .field("len", &self.entries.len())
            .finish()
    }
}

thread_local! {
    static PLAIN: RefCell<LocalMap> = RefCell::new(HashMap::new());
    static INHERITABLE: RefCell<InheritableMap> = RefCell::new(InheritableMap::default());
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

fn next_key() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Installs the current fiber on this worker.
///
/// # Panics
///
/// Panics if the slot already holds a fiber; two slices on one worker is
/// a fatal structural error.
pub(crate) fn install_current(fiber: &Arc<Fiber>) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "worker already runs a fiber; refusing to install another"
        );
        *slot = Some(Arc::clone(fiber));
    });
}

/// Clears the current-fiber slot on this worker.
pub(crate) fn clear_current() {
    CURRENT.with(|slot| slot.borrow_mut().take());
}

/// The fiber currently executing on this thread, if any.
#[must_use]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Symmetric swap of the thread's ambient views with the given saved
/// views. Called once at slice entry and once at slice exit.
pub(crate) fn swap_views(plain: &mut LocalMap, inheritable: &mut InheritableMap) {
    PLAIN.with(|m| std::mem::swap(&mut *m.borrow_mut(), plain));
    INHERITABLE.with(|m| std::mem::swap(&mut *m.borrow_mut(), inheritable));
}

/// Deep copy of this thread's inheritable view, taken at fiber
/// construction.
pub(crate) fn snapshot_inheritable() -> InheritableMap {
    INHERITABLE.with(|m| m.borrow().snapshot())
}

/// A typed key into the plain fiber-local view.
///
/// Declare as a `static`; the initializer runs on first access per
/// fiber (or per plain thread). Re-entrant access from within `with` is
/// not supported.
///
/// ```
/// use fibril::FiberLocal;
///
/// static COUNTER: FiberLocal<u32> = FiberLocal::new(|| 0);
///
/// COUNTER.with(|c| *c += 1);
/// assert_eq!(COUNTER.get(), 1);
/// ```
pub struct FiberLocal<T: Send + 'static> {
    key: OnceLock<u64>,
    init: fn() -> T,
}

impl<T: Send + 'static> FiberLocal<T> {
    /// Creates a key with the given initializer.
    #[must_use]
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            key: OnceLock::new(),
            init,
        }
    }

    fn key(&'static self) -> u64 {
        *self.key.get_or_init(next_key)
    }

    /// Runs `f` with the value in the active view, initializing it
    /// first if absent.
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        PLAIN.with(|m| {
            let mut map = m.borrow_mut();
            let slot = map
                .entry(self.key())
                .or_insert_with(|| Box::new((self.init)()));
            let value = slot
                .downcast_mut::<T>()
                .expect("fiber-local key bound to a different type");
            f(value)
        })
    }

    /// Replaces the value in the active view.
    pub fn set(&'static self, value: T) {
        self.with(|slot| *slot = value);
    }

    /// Clones the value out of the active view.
    #[must_use]
    pub fn get(&'static self) -> T
    where
        T: Clone,
    {
        self.with(|slot| slot.clone())
    }
}

/// A typed key into the inheritable fiber-local view.
///
/// Values are deep-copied into fibers constructed while the value is
/// visible, so `Clone` is required.
pub struct InheritableFiberLocal<T: Send + Clone + 'static> {
    key: OnceLock<u64>,
    init: fn() -> T,
}

impl<T: Send + Clone + 'static> InheritableFiberLocal<T> {
    /// Creates a key with the given initializer.
    #[must_use]
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            key: OnceLock::new(),
            init,
        }
    }

    fn key(&'static self) -> u64 {
        *self.key.get_or_init(next_key)
    }

    /// Runs `f` with the value in the active inheritable view,
    /// initializing it first if absent.
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        INHERITABLE.with(|m| {
            let mut map = m.borrow_mut();
            let slot = map
                .entries
                .entry(self.key())
                .or_insert_with(|| Box::new((self.init)()));
            let value = slot
                .as_any_mut()
                .downcast_mut::<T>()
                .expect("inheritable fiber-local key bound to a different type");
            f(value)
        })
    }

    /// Replaces the value in the active inheritable view.
    pub fn set(&'static self, value: T) {
        self.with(|slot| *slot = value);
    }

    /// Clones the value out of the active inheritable view.
    #[must_use]
    pub fn get(&'static self) -> T {
        self.with(|slot| slot.clone())
    }
}
