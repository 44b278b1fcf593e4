//! Basic synchronization primitives.
//!
//! This module provides the synchronization vocabulary shared by every part of
//! the runtime, plus the per-thread identity used to tag lock holders and
//! collector registrations. Low-level modules can depend on this without
//! pulling in the entire VM subsystem.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt::{self, Display, Formatter},
    marker::PhantomData,
    num::NonZeroU64,
};

pub use parking_lot::{Condvar, Mutex};
pub use std::sync::{
    atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Global counter for allocating thread identifiers.
/// Identifier 0 is reserved: the lock word and the holder slot use it for "nobody".
static NEXT_THREAD_IDENT: AtomicU64 = AtomicU64::new(1);

/// Keys of [`ThreadLocalRef`] cells; never reused.
static NEXT_LOCAL_KEY: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Cached identifier for the current thread
    static THREAD_IDENT: Cell<Option<ThreadIdent>> = const { Cell::new(None) };

    static THREAD_LOCALS: RefCell<HashMap<usize, Arc<dyn Any + Send + Sync>>> =
        RefCell::new(HashMap::new());
}

/// Stable, non-zero identifier of an OS thread for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadIdent(NonZeroU64);

impl ThreadIdent {
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Inverse of [`ThreadIdent::as_u64`]; `None` for the reserved value 0.
    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl Display for ThreadIdent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn allocate_ident() -> ThreadIdent {
    let raw = NEXT_THREAD_IDENT.fetch_add(1, Ordering::Relaxed);
    // starts at 1 and a u64 will not wrap in practice
    ThreadIdent(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
}

/// Give the current thread an identifier chosen by its spawner.
///
/// Must run before anything on the thread calls [`get_ident`]; returns false if
/// the thread already had one.
pub(crate) fn install_ident(ident: ThreadIdent) -> bool {
    THREAD_IDENT.with(|cell| {
        if cell.get().is_some() {
            return false;
        }
        cell.set(Some(ident));
        true
    })
}

/// Get the current thread's identifier, allocating one on first use.
pub fn get_ident() -> ThreadIdent {
    THREAD_IDENT.with(|cell| match cell.get() {
        Some(id) => id,
        None => {
            let id = allocate_ident();
            cell.set(Some(id));
            id
        }
    })
}

/// A reference with a separate value on every thread.
///
/// Each thread starts out with no value. Values live until they are replaced,
/// cleared, or their thread exits.
#[derive(Debug)]
pub struct ThreadLocalRef<T> {
    key: usize,
    _marker: PhantomData<fn() -> Arc<T>>,
}

impl<T: Send + Sync + 'static> ThreadLocalRef<T> {
    pub fn new() -> Self {
        Self {
            key: NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed),
            _marker: PhantomData,
        }
    }

    /// The current thread's value.
    pub fn get(&self) -> Option<Arc<T>> {
        let value = THREAD_LOCALS.with(|locals| locals.borrow().get(&self.key).cloned())?;
        value.downcast::<T>().ok()
    }

    /// Replace the current thread's value; `None` clears it.
    pub fn set(&self, value: Option<Arc<T>>) {
        THREAD_LOCALS.with(|locals| {
            let mut locals = locals.borrow_mut();
            match value {
                Some(value) => {
                    locals.insert(self.key, value);
                }
                None => {
                    locals.remove(&self.key);
                }
            }
        });
    }
}

impl<T: Send + Sync + 'static> Default for ThreadLocalRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ident_is_stable_per_thread() {
        let a = get_ident();
        let b = get_ident();
        assert_eq!(a, b);
        assert_ne!(a.as_u64(), 0);
    }

    #[test]
    fn test_ident_differs_across_threads() {
        let here = get_ident();
        let there = thread::spawn(get_ident).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_installed_ident_is_used() {
        let chosen = allocate_ident();
        let seen = thread::spawn(move || {
            assert!(install_ident(chosen));
            assert!(!install_ident(chosen));
            get_ident()
        })
        .join()
        .unwrap();
        assert_eq!(seen, chosen);
    }

    #[test]
    fn test_from_u64_rejects_zero() {
        assert!(ThreadIdent::from_u64(0).is_none());
        let id = get_ident();
        assert_eq!(ThreadIdent::from_u64(id.as_u64()), Some(id));
    }

    #[test]
    fn test_thread_local_ref_is_per_thread() {
        let cell = Arc::new(ThreadLocalRef::<String>::new());
        assert!(cell.get().is_none());
        cell.set(Some(Arc::new("main".to_string())));

        let other = cell.clone();
        let seen = thread::spawn(move || {
            let before = other.get();
            other.set(Some(Arc::new("worker".to_string())));
            (before, other.get())
        })
        .join()
        .unwrap();
        assert_eq!(seen.0, None);
        assert_eq!(seen.1.as_deref().map(String::as_str), Some("worker"));
        assert_eq!(cell.get().as_deref().map(String::as_str), Some("main"));

        cell.set(None);
        assert!(cell.get().is_none());
    }

    #[test]
    fn test_thread_local_refs_are_independent() {
        let a = ThreadLocalRef::<u32>::new();
        let b = ThreadLocalRef::<u32>::new();
        a.set(Some(Arc::new(1)));
        assert_eq!(a.get().as_deref(), Some(&1));
        assert!(b.get().is_none());
    }
}
